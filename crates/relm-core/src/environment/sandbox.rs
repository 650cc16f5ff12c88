use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::environment::{Environment, EnvironmentProvider};
use crate::errors::RelmError;
use crate::handler::LmHandler;
use crate::poller::BrokerPoller;
use crate::types::{CompletionRecord, ExecutionResult, filter_internal_locals};

/// Port the broker binary listens on inside the sandbox.
pub const SANDBOX_BROKER_PORT: u16 = 8888;

/// Upper bound on a single remote code execution.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(600);

const HEALTH_ATTEMPTS: usize = 20;
const HEALTH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// What to provision when creating a sandbox.
#[derive(Clone, Debug)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub timeout_minutes: u64,
    pub network_access: bool,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            name: "relm-sandbox".to_string(),
            image: "relm-sandbox:latest".to_string(),
            timeout_minutes: 60,
            network_access: true,
        }
    }
}

/// Captured output of a command or fragment run inside a sandbox.
#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A tunnel from the host to a sandbox port.
#[derive(Clone, Debug)]
pub struct Exposure {
    pub url: String,
    pub exposure_id: String,
}

/// Backend operations against an isolated sandbox. Implementations wrap
/// whatever isolation substrate the deployment uses.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Provision a sandbox, returning its id.
    async fn create(&self, spec: &SandboxSpec) -> Result<String, RelmError>;

    /// Run a shell command inside the sandbox.
    async fn exec_command(&self, sandbox_id: &str, command: &str) -> Result<ExecOutput, RelmError>;

    /// Run a code fragment in the sandbox's resident interpreter process.
    /// The last stdout line must be the JSON execution report.
    async fn run_fragment(&self, sandbox_id: &str, code: &str) -> Result<ExecOutput, RelmError>;

    /// Install the `context` binding inside the sandbox interpreter.
    async fn write_context(&self, sandbox_id: &str, payload: &Value) -> Result<(), RelmError>;

    /// Open a host-reachable tunnel to a sandbox port.
    async fn expose(&self, sandbox_id: &str, port: u16) -> Result<Exposure, RelmError>;

    async fn unexpose(&self, sandbox_id: &str, exposure_id: &str) -> Result<(), RelmError>;

    async fn destroy(&self, sandbox_id: &str) -> Result<(), RelmError>;
}

/// JSON report a fragment execution prints as its last stdout line.
#[derive(Debug, Deserialize)]
struct FragmentReport {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    locals: BTreeMap<String, Value>,
}

/// Execution environment backed by an isolated sandbox.
///
/// Setup provisions the sandbox, boots the callback broker inside it, tunnels
/// the broker port out, and health-checks it. `bind_handler` then starts the
/// host-side poller that bridges sandboxed `llm_query` calls to the turn's
/// handler endpoint. Any setup failure tears down whatever was provisioned
/// before the error is returned.
pub struct SandboxEnv {
    driver: Arc<dyn SandboxDriver>,
    spec: SandboxSpec,
    start_broker_command: String,
    exec_timeout: Duration,
    http: reqwest::Client,
    sandbox_id: Option<String>,
    broker_url: Option<String>,
    exposure_id: Option<String>,
    poller: Option<BrokerPoller>,
    records: Arc<Mutex<Vec<CompletionRecord>>>,
    last_locals: BTreeMap<String, Value>,
}

impl SandboxEnv {
    pub fn new(driver: Arc<dyn SandboxDriver>, spec: SandboxSpec) -> Self {
        Self {
            driver,
            spec,
            // The broker binary takes its port from RELM_BROKER_PORT.
            start_broker_command: format!(
                "RELM_BROKER_PORT={SANDBOX_BROKER_PORT} nohup relm-broker > /tmp/relm-broker.log 2>&1 &"
            ),
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            http: reqwest::Client::new(),
            sandbox_id: None,
            broker_url: None,
            exposure_id: None,
            poller: None,
            records: Arc::new(Mutex::new(Vec::new())),
            last_locals: BTreeMap::new(),
        }
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    pub fn with_start_broker_command(mut self, command: impl Into<String>) -> Self {
        self.start_broker_command = command.into();
        self
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        self.sandbox_id.as_deref()
    }

    pub fn broker_url(&self) -> Option<&str> {
        self.broker_url.as_deref()
    }

    async fn try_setup(&mut self) -> Result<(), RelmError> {
        let sandbox_id = self.driver.create(&self.spec).await?;
        debug!(%sandbox_id, "sandbox created");
        self.sandbox_id = Some(sandbox_id.clone());

        self.driver
            .exec_command(&sandbox_id, &self.start_broker_command)
            .await?;

        let exposure = self.driver.expose(&sandbox_id, SANDBOX_BROKER_PORT).await?;
        self.broker_url = Some(exposure.url.clone());
        self.exposure_id = Some(exposure.exposure_id);

        self.wait_for_broker(&exposure.url).await?;
        debug!(url = %exposure.url, "sandbox broker reachable");
        Ok(())
    }

    async fn wait_for_broker(&self, url: &str) -> Result<(), RelmError> {
        for attempt in 0..HEALTH_ATTEMPTS {
            match self.http.get(format!("{url}/health")).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    debug!(attempt, status = %response.status(), "broker not ready")
                }
                Err(error) => debug!(attempt, %error, "broker health check failed"),
            }
            tokio::time::sleep(HEALTH_RETRY_DELAY).await;
        }
        Err(RelmError::Sandbox(format!(
            "broker at {url} did not become healthy"
        )))
    }

    fn parse_report(&self, raw: ExecOutput) -> (String, String, BTreeMap<String, Value>) {
        let last_line = raw
            .stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty());
        if let Some(line) = last_line {
            if let Ok(report) = serde_json::from_str::<FragmentReport>(line.trim()) {
                return (report.stdout, report.stderr, report.locals);
            }
        }
        // No structured report; pass the raw channels through.
        let stderr = if raw.stderr.is_empty() {
            "execution produced no structured report".to_string()
        } else {
            raw.stderr
        };
        (raw.stdout, stderr, BTreeMap::new())
    }
}

#[async_trait]
impl Environment for SandboxEnv {
    async fn setup(&mut self) -> Result<(), RelmError> {
        if let Err(error) = self.try_setup().await {
            if let Err(cleanup_error) = self.cleanup().await {
                warn!(%cleanup_error, "cleanup after failed setup");
            }
            return Err(error);
        }
        Ok(())
    }

    async fn bind_handler(&mut self, handler: &Arc<LmHandler>) -> Result<(), RelmError> {
        let broker_url = self
            .broker_url
            .clone()
            .ok_or_else(|| RelmError::Sandbox("environment not set up".to_string()))?;
        let handler_addr = handler.addr().ok_or_else(|| {
            RelmError::Configuration("handler endpoint not started".to_string())
        })?;

        if let Some(mut poller) = self.poller.take() {
            poller.stop().await;
        }
        self.poller = Some(BrokerPoller::start(
            broker_url,
            handler_addr,
            self.records.clone(),
        ));
        Ok(())
    }

    async fn load_context(&mut self, payload: Value) -> Result<(), RelmError> {
        let sandbox_id = self
            .sandbox_id
            .clone()
            .ok_or_else(|| RelmError::Sandbox("environment not set up".to_string()))?;
        self.driver.write_context(&sandbox_id, &payload).await
    }

    async fn execute(&mut self, code: &str) -> Result<ExecutionResult, RelmError> {
        let sandbox_id = self
            .sandbox_id
            .clone()
            .ok_or_else(|| RelmError::Sandbox("environment not set up".to_string()))?;
        {
            let mut records = self
                .records
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            records.clear();
        }

        let started = Instant::now();
        let raw = tokio::time::timeout(self.exec_timeout, self.driver.run_fragment(&sandbox_id, code))
            .await
            .map_err(|_| {
                RelmError::RemoteTimeout(format!(
                    "code execution exceeded {}s",
                    self.exec_timeout.as_secs()
                ))
            })??;

        let (stdout, stderr, locals) = self.parse_report(raw);
        self.last_locals.extend(locals);

        let sub_calls = {
            let mut records = self
                .records
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *records)
        };

        Ok(ExecutionResult {
            stdout,
            stderr,
            locals: filter_internal_locals(self.last_locals.clone()),
            duration_ms: started.elapsed().as_millis() as u64,
            sub_calls,
        })
    }

    fn lookup_local(&self, name: &str) -> Option<Value> {
        self.last_locals.get(name).cloned()
    }

    fn locals_snapshot(&self) -> BTreeMap<String, Value> {
        filter_internal_locals(self.last_locals.clone())
    }

    fn restore_locals(&mut self, locals: BTreeMap<String, Value>) {
        self.last_locals.extend(locals);
    }

    /// Tear down the poller, the tunnel, and the sandbox. Safe to call twice
    /// and after a partial setup.
    async fn cleanup(&mut self) -> Result<(), RelmError> {
        if let Some(mut poller) = self.poller.take() {
            poller.stop().await;
        }
        self.broker_url = None;

        if let Some(sandbox_id) = self.sandbox_id.take() {
            if let Some(exposure_id) = self.exposure_id.take() {
                if let Err(error) = self.driver.unexpose(&sandbox_id, &exposure_id).await {
                    warn!(%error, "failed to close sandbox tunnel");
                }
            }
            if let Err(error) = self.driver.destroy(&sandbox_id).await {
                warn!(%error, "failed to destroy sandbox");
            }
        }
        Ok(())
    }
}

/// Provider for sandbox-backed environments.
pub struct SandboxProvider {
    driver: Arc<dyn SandboxDriver>,
    spec: SandboxSpec,
    exec_timeout: Duration,
}

impl SandboxProvider {
    pub fn new(driver: Arc<dyn SandboxDriver>, spec: SandboxSpec) -> Self {
        Self {
            driver,
            spec,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }
}

#[async_trait]
impl EnvironmentProvider for SandboxProvider {
    fn supports_persistence(&self) -> bool {
        true
    }

    async fn provision(&self) -> Result<Box<dyn Environment>, RelmError> {
        let mut env = SandboxEnv::new(self.driver.clone(), self.spec.clone())
            .with_exec_timeout(self.exec_timeout);
        env.setup().await?;
        Ok(Box::new(env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Driver that records calls and replies with canned fragment reports.
    struct ScriptedDriver {
        create_fails: bool,
        destroyed: AtomicUsize,
        unexposed: AtomicUsize,
        reports: Mutex<Vec<String>>,
        fragment_delay: Duration,
    }

    impl ScriptedDriver {
        fn new(reports: Vec<String>) -> Self {
            Self {
                create_fails: false,
                destroyed: AtomicUsize::new(0),
                unexposed: AtomicUsize::new(0),
                reports: Mutex::new(reports),
                fragment_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl SandboxDriver for ScriptedDriver {
        async fn create(&self, _spec: &SandboxSpec) -> Result<String, RelmError> {
            if self.create_fails {
                return Err(RelmError::Sandbox("no capacity".to_string()));
            }
            Ok("sbx-1".to_string())
        }

        async fn exec_command(
            &self,
            _sandbox_id: &str,
            _command: &str,
        ) -> Result<ExecOutput, RelmError> {
            Ok(ExecOutput::default())
        }

        async fn run_fragment(
            &self,
            _sandbox_id: &str,
            _code: &str,
        ) -> Result<ExecOutput, RelmError> {
            if !self.fragment_delay.is_zero() {
                tokio::time::sleep(self.fragment_delay).await;
            }
            let report = self
                .reports
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| "{}".to_string());
            Ok(ExecOutput {
                stdout: format!("noise line\n{report}\n"),
                stderr: String::new(),
            })
        }

        async fn write_context(
            &self,
            _sandbox_id: &str,
            _payload: &Value,
        ) -> Result<(), RelmError> {
            Ok(())
        }

        async fn expose(&self, _sandbox_id: &str, port: u16) -> Result<Exposure, RelmError> {
            Ok(Exposure {
                url: format!("http://sandbox.invalid:{port}"),
                exposure_id: "exp-1".to_string(),
            })
        }

        async fn unexpose(&self, _sandbox_id: &str, _exposure_id: &str) -> Result<(), RelmError> {
            self.unexposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn destroy(&self, _sandbox_id: &str) -> Result<(), RelmError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn report(stdout: &str, locals: Value) -> String {
        json!({"stdout": stdout, "stderr": "", "locals": locals}).to_string()
    }

    /// Build an env whose setup already ran, skipping the broker health check
    /// that needs a live endpoint.
    async fn primed_env(driver: Arc<ScriptedDriver>) -> SandboxEnv {
        let mut env = SandboxEnv::new(driver.clone(), SandboxSpec::default());
        env.sandbox_id = Some("sbx-1".to_string());
        env.broker_url = Some("http://sandbox.invalid:8888".to_string());
        env.exposure_id = Some("exp-1".to_string());
        env
    }

    #[test]
    fn default_bootstrap_sets_the_port_the_binary_reads() {
        let env = SandboxEnv::new(
            Arc::new(ScriptedDriver::new(vec![])),
            SandboxSpec::default(),
        );
        assert!(
            env.start_broker_command
                .contains(&format!("RELM_BROKER_PORT={SANDBOX_BROKER_PORT} "))
        );
    }

    #[tokio::test]
    async fn execute_parses_last_stdout_line_as_report() {
        let driver = Arc::new(ScriptedDriver::new(vec![report(
            "computed\n",
            json!({"x": 42, "_scratch": 1}),
        )]));
        let mut env = primed_env(driver).await;

        let result = env.execute("x = 42").await.unwrap();
        assert_eq!(result.stdout, "computed\n");
        assert_eq!(result.locals["x"], json!(42));
        assert!(!result.locals.contains_key("_scratch"));
        assert_eq!(env.lookup_local("x"), Some(json!(42)));
    }

    #[tokio::test]
    async fn unparseable_report_falls_back_to_raw_output() {
        let driver = Arc::new(ScriptedDriver::new(vec!["not json".to_string()]));
        let mut env = primed_env(driver).await;

        let result = env.execute("whatever").await.unwrap();
        assert!(result.stdout.contains("not json"));
        assert!(result.stderr.contains("no structured report"));
    }

    #[tokio::test]
    async fn slow_fragment_hits_the_execution_timeout() {
        let mut driver = ScriptedDriver::new(vec![report("late", json!({}))]);
        driver.fragment_delay = Duration::from_millis(200);
        let mut env = primed_env(Arc::new(driver))
            .await
            .with_exec_timeout(Duration::from_millis(20));

        let result = env.execute("sleep").await;
        assert!(matches!(result, Err(RelmError::RemoteTimeout(_))));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_tears_everything_down() {
        let driver = Arc::new(ScriptedDriver::new(vec![]));
        let mut env = primed_env(driver.clone()).await;

        env.cleanup().await.unwrap();
        env.cleanup().await.unwrap();
        assert_eq!(driver.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(driver.unexposed.load(Ordering::SeqCst), 1);
        assert!(env.sandbox_id().is_none());
    }

    #[tokio::test]
    async fn failed_create_leaves_nothing_behind() {
        let mut driver = ScriptedDriver::new(vec![]);
        driver.create_fails = true;
        let driver = Arc::new(driver);
        let mut env = SandboxEnv::new(driver.clone(), SandboxSpec::default());

        let result = env.setup().await;
        assert!(matches!(result, Err(RelmError::Sandbox(_))));
        assert_eq!(driver.destroyed.load(Ordering::SeqCst), 0);
        assert!(env.sandbox_id().is_none());
    }

    #[tokio::test]
    async fn execute_before_setup_is_a_sandbox_error() {
        let driver = Arc::new(ScriptedDriver::new(vec![]));
        let mut env = SandboxEnv::new(driver, SandboxSpec::default());
        let result = env.execute("x = 1").await;
        assert!(matches!(result, Err(RelmError::Sandbox(_))));
    }
}
