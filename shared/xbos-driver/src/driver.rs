//! Driver runtime
//!
//! The surface device integrations build on: register series, push readings
//! and metadata, hook poll loops and subscriptions, then [`Driver::start`].

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::UnitOfTime;
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::listener::{DatagramHandler, UdpListener};
use crate::metadata::{self, Metadata};
use crate::registry::SeriesRegistry;
use crate::report::ReportBatcher;
use crate::scheduler::{RunSummary, TaskScheduler};
use crate::subscription::{MessageHandler, SubscriptionClient, SubscriptionContext};
use crate::timeseries::{ActuatorSpec, StreamType, TimeSeries};

struct ActuatorBinding {
    path: String,
    handler: Arc<dyn MessageHandler>,
    args: Value,
}

pub struct Driver {
    config: DriverConfig,
    series: SeriesRegistry,
    base_metadata: Metadata,
    scheduler: TaskScheduler,
    http: reqwest::Client,
    // sensor path -> its actuator
    actuators: HashMap<String, ActuatorBinding>,
    udp_ports: HashSet<u16>,
}

impl Driver {
    /// `base_metadata` is merged into every series when it is registered
    pub fn new(config: DriverConfig, base_metadata: Option<Value>) -> Result<Self> {
        config.validate()?;
        let base_metadata = match base_metadata {
            Some(value) => metadata::as_metadata(&value)?.clone(),
            None => Metadata::new(),
        };
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DriverError::Setup(format!("cannot build HTTP client: {}", e)))?;

        info!(
            instance_uuid = %config.instance_uuid,
            destinations = config.report_destinations.len(),
            archiver = %config.archiver,
            "Driver created"
        );

        Ok(Self {
            config,
            series: SeriesRegistry::new(),
            base_metadata,
            scheduler: TaskScheduler::new(),
            http,
            actuators: HashMap::new(),
            udp_ports: HashSet::new(),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Namespace every series id is derived from
    pub fn namespace(&self) -> Uuid {
        self.config.instance_uuid
    }

    /// Shared handle to the series registry for poll jobs and handlers
    pub fn series(&self) -> SeriesRegistry {
        self.series.clone()
    }

    pub fn task_count(&self) -> usize {
        self.scheduler.len()
    }

    pub fn register_timeseries(
        &self,
        path: &str,
        unit_of_measure: &str,
        unit_of_time: UnitOfTime,
        stream_type: StreamType,
    ) -> Result<String> {
        let series = TimeSeries::create(
            &self.config.instance_uuid,
            path,
            unit_of_measure,
            unit_of_time,
            stream_type,
        )?;
        let series = self.series.register(series)?;
        series.attach_metadata(&self.base_metadata);
        Ok(path.to_string())
    }

    pub fn attach_metadata(&self, path: &str, metadata: &Value) -> Result<()> {
        self.series.attach_metadata(path, metadata)
    }

    pub fn add_reading(&self, path: &str, value: Value, timestamp: Option<i64>) -> Result<()> {
        self.series.add_reading(path, value, timestamp)
    }

    /// Call `job` every `interval`, starting one interval from now
    pub fn register_poll<F, Fut>(
        &mut self,
        name: impl Into<String>,
        interval: Duration,
        job: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.scheduler.register_periodic(name, interval, job)
    }

    /// Subscribe to `query` on `endpoint`, or on the archiver's republish
    /// endpoint when none is given
    pub fn register_subscription<H>(
        &mut self,
        query: &str,
        handler: H,
        endpoint: Option<&str>,
        args: Value,
    ) where
        H: MessageHandler,
    {
        self.subscribe(query.to_string(), Arc::new(handler), endpoint, None, args);
    }

    fn subscribe(
        &mut self,
        query: String,
        handler: Arc<dyn MessageHandler>,
        endpoint: Option<&str>,
        actuator: Option<&str>,
        args: Value,
    ) {
        let endpoint = endpoint
            .map(String::from)
            .unwrap_or_else(|| self.config.republish_url());
        let mut context = SubscriptionContext::new(query, endpoint, self.series.clone()).with_args(args);
        if let Some(path) = actuator {
            context = context.with_actuator(path);
        }

        let name = format!("subscription[{}]", context.query);
        let client = SubscriptionClient::new(self.http.clone(), handler, context);
        self.scheduler
            .register_stream(name, async move { client.subscribe().await.map(|_| ()) });
    }

    /// Give the series at `path` a writable counterpart at `<path>_act` and
    /// subscribe `handler` to override requests for it. Returns the
    /// actuator's path.
    pub fn attach_actuator<H>(
        &mut self,
        path: &str,
        spec: ActuatorSpec,
        handler: H,
        args: Value,
    ) -> Result<String>
    where
        H: MessageHandler,
    {
        let sensor = self
            .series
            .get(path)
            .ok_or_else(|| DriverError::UnknownSeries(path.to_string()))?;
        if sensor.actuator().is_some() {
            return Err(DriverError::Validation(format!(
                "{} already has an actuator",
                path
            )));
        }

        let actuator = self.series.register(sensor.new_actuator(spec)?)?;
        sensor.attach_actuator(Arc::clone(&actuator))?;

        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let query = format!("Actuator/override = '{}'", actuator.id());
        self.subscribe(
            query,
            Arc::clone(&handler),
            None,
            Some(actuator.path()),
            args.clone(),
        );
        self.actuators.insert(
            path.to_string(),
            ActuatorBinding {
                path: actuator.path().to_string(),
                handler,
                args,
            },
        );

        info!(sensor = %path, actuator = %actuator.path(), id = %actuator.id(), "Actuator attached");
        Ok(actuator.path().to_string())
    }

    /// Drive the actuator of `path` from a named schedule point.
    ///
    /// The actuator's handler also receives the schedule's republished
    /// messages, and the series records which schedule it follows.
    pub fn attach_schedule(&mut self, path: &str, schedule_name: &str, point_name: &str) -> Result<()> {
        let sensor = self
            .series
            .get(path)
            .ok_or_else(|| DriverError::UnknownSeries(path.to_string()))?;
        if sensor.is_actuator() {
            return Err(DriverError::Validation(format!(
                "{} is an actuator; schedule its sensor instead",
                path
            )));
        }
        for name in [schedule_name, point_name] {
            if name.is_empty() || name.contains('\'') {
                return Err(DriverError::Validation(format!(
                    "invalid schedule name '{}'",
                    name
                )));
            }
        }
        let binding = self.actuators.get(path).ok_or_else(|| {
            DriverError::Validation(format!(
                "{} cannot be scheduled because it has no actuator",
                path
            ))
        })?;

        let query = format!(
            "Metadata/Schedule/Name = '{}' and Metadata/Schedule/Point/Name = '{}'",
            schedule_name, point_name
        );
        let handler = Arc::clone(&binding.handler);
        let actuator_path = binding.path.clone();
        let args = binding.args.clone();
        self.subscribe(query, handler, None, Some(&actuator_path), args);

        self.attach_metadata(
            path,
            &json!({
                "Schedule": {
                    "Subscribed": schedule_name,
                    "Point": {"Subscribed": point_name}
                }
            }),
        )
    }

    /// Listen for datagrams on `0.0.0.0:port`. Returns the bound address.
    pub fn listen_udp<H>(&mut self, port: u16, read_size: usize, handler: H) -> Result<SocketAddr>
    where
        H: DatagramHandler,
    {
        if port != 0 && self.udp_ports.contains(&port) {
            return Err(DriverError::Validation(format!(
                "UDP port {} is already in use by this driver",
                port
            )));
        }

        let listener = UdpListener::bind(port, read_size)?;
        let addr = listener.local_addr()?;
        self.udp_ports.insert(addr.port());

        let handler: Arc<dyn DatagramHandler> = Arc::new(handler);
        self.scheduler
            .register_stream(format!("udp[{}]", addr.port()), listener.run(handler, self.series.clone()));
        Ok(addr)
    }

    /// A batcher for this driver's series and destinations
    pub fn report_batcher(&self) -> Result<ReportBatcher> {
        let http = reqwest::Client::builder()
            .timeout(self.config.report_timeout())
            .build()
            .map_err(|e| DriverError::Setup(format!("cannot build HTTP client: {}", e)))?;
        Ok(ReportBatcher::new(
            http,
            self.config.report_destinations.clone(),
            self.config.delivery_policy,
            self.series.clone(),
        ))
    }

    /// Add the report loop and run every task until they have all exited
    pub async fn start(mut self) -> Result<RunSummary> {
        if self.config.report_destinations.is_empty() {
            warn!("No report destinations configured; readings will stay buffered");
        } else {
            let batcher = Arc::new(self.report_batcher()?);
            self.scheduler
                .register_periodic("report", self.config.report_interval(), move || {
                    let batcher = Arc::clone(&batcher);
                    async move { batcher.flush().await.map(|_| ()) }
                })?;
        }

        info!(
            series = self.series.len(),
            tasks = self.scheduler.len(),
            "Driver starting"
        );
        Ok(self.scheduler.run().await)
    }
}
