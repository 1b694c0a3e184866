use crate::config::{CaptureMode, Config};
use crate::model::{BridgeFrame, SessionStatus};
use crate::page::{ChromeLauncher, PageLauncher};
use crate::router::{Credentials, RouterSession, SessionError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

pub type CommandSender = mpsc::Sender<CaptureCommand>;
pub type CommandReply = oneshot::Sender<Result<(), CommandError>>;

/// Remote-control requests forwarded from the web server.
#[derive(Debug)]
pub enum CaptureCommand {
    Navigate { url: String, reply: CommandReply },
    Click { selector: String, reply: CommandReply },
    Fill { selector: String, value: String, reply: CommandReply },
    Relogin { reply: CommandReply },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("router session not ready")]
    NotReady,
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Failed(String),
    #[error("capture worker stopped")]
    WorkerGone,
}

/// Exponential retry delay: doubles from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub fn spawn(
    config: Config,
    credentials: Credentials,
    tx: watch::Sender<BridgeFrame>,
    shutdown_rx: watch::Receiver<bool>,
) -> (CommandSender, tokio::task::JoinHandle<()>) {
    let launcher = Arc::new(ChromeLauncher::new(config.browser.clone()));
    spawn_with(launcher, config, credentials, tx, shutdown_rx)
}

fn spawn_with(
    launcher: Arc<dyn PageLauncher>,
    config: Config,
    credentials: Credentials,
    tx: watch::Sender<BridgeFrame>,
    shutdown_rx: watch::Receiver<bool>,
) -> (CommandSender, tokio::task::JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let worker = CaptureWorker::new(config, credentials, tx, launcher);
    let handle = tokio::spawn(worker.run(cmd_rx, shutdown_rx));
    (cmd_tx, handle)
}

struct CaptureWorker {
    config: Config,
    credentials: Credentials,
    launcher: Arc<dyn PageLauncher>,
    tx: watch::Sender<BridgeFrame>,
    session: Option<RouterSession>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    failures: u32,
}

impl CaptureWorker {
    fn new(
        config: Config,
        credentials: Credentials,
        tx: watch::Sender<BridgeFrame>,
        launcher: Arc<dyn PageLauncher>,
    ) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.capture.backoff_initial_ms),
            Duration::from_millis(config.capture.backoff_max_ms),
        );
        let mode = config.capture.mode;
        tx.send_modify(|frame| frame.mode = mode);
        Self {
            config,
            credentials,
            launcher,
            tx,
            session: None,
            backoff,
            retry_at: None,
            failures: 0,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<CaptureCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.capture.interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // While backing off, the retry deadline replaces the regular tick.
            let retry = self.retry_at;
            tokio::select! {
                _ = ticker.tick(), if retry.is_none() => self.tick().await,
                _ = tokio::time::sleep_until(retry.unwrap_or_else(Instant::now)), if retry.is_some() => {
                    self.retry_at = None;
                    self.tick().await;
                    ticker.reset();
                }
                Some(cmd) = cmd_rx.recv() => self.handle(cmd).await,
                _ = shutdown_rx.changed() => break,
            }
        }

        if let Some(session) = self.session.take() {
            session.close().await;
        }
        tracing::info!("capture worker stopped");
    }

    async fn tick(&mut self) {
        let refresh = Duration::from_secs(self.config.capture.session_refresh_secs);
        let stale = match &self.session {
            Some(session) => !session.is_alive() || session.needs_refresh(refresh),
            None => true,
        };
        if stale {
            if let Some(old) = self.session.take() {
                tracing::info!("refreshing router session");
                old.close().await;
            }
            if let Err(err) = self.open_session().await {
                self.record_failure(&err).await;
                return;
            }
        }

        self.capture().await;
    }

    async fn open_session(&mut self) -> Result<(), SessionError> {
        self.tx.send_modify(|frame| {
            frame.status = SessionStatus::Loading;
            frame.logged_in = false;
        });

        let session =
            RouterSession::open(self.launcher.as_ref(), &self.config, &self.credentials).await?;
        let started = session.started_unix();
        self.session = Some(session);
        self.tx.send_modify(|frame| {
            frame.logged_in = true;
            frame.session_started_unix = Some(started);
        });
        Ok(())
    }

    async fn capture(&mut self) {
        let mode = self.config.capture.mode;
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match session.capture(mode).await {
            Ok(snapshot) => {
                self.failures = 0;
                self.retry_at = None;
                self.backoff.reset();
                self.tx.send_modify(|frame| {
                    frame.status = SessionStatus::Ready;
                    frame.message = None;
                    frame.consecutive_failures = 0;
                    frame.snapshot = Some(Arc::new(snapshot));
                });
            }
            Err(err) => self.record_failure(&err).await,
        }
    }

    async fn record_failure(&mut self, err: &SessionError) {
        self.failures = self.failures.saturating_add(1);
        let delay = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + delay);

        let drop_session = err.requires_new_session()
            || self.failures >= self.config.capture.max_failures;
        if drop_session {
            if let Some(old) = self.session.take() {
                old.close().await;
            }
        }

        tracing::warn!(
            error = %err,
            failures = self.failures,
            retry_in_ms = delay.as_millis() as u64,
            new_session = drop_session,
            "router capture failed"
        );

        let failures = self.failures;
        let logged_in = self.session.is_some();
        let message = err.to_string();
        self.tx.send_modify(|frame| {
            frame.status = SessionStatus::Error;
            frame.message = Some(message);
            frame.consecutive_failures = failures;
            frame.logged_in = logged_in;
        });
    }

    async fn handle(&mut self, cmd: CaptureCommand) {
        match cmd {
            CaptureCommand::Relogin { reply } => {
                if let Some(old) = self.session.take() {
                    old.close().await;
                }
                self.retry_at = None;
                self.backoff.reset();
                let result = match self.open_session().await {
                    Ok(()) => {
                        self.capture().await;
                        Ok(())
                    }
                    Err(err) => {
                        self.record_failure(&err).await;
                        Err(CommandError::Failed(err.to_string()))
                    }
                };
                let _ = reply.send(result);
            }
            CaptureCommand::Navigate { url, reply } => {
                let result = match self.session.as_mut() {
                    Some(session) => session.navigate(&url).await.map(|target| {
                        tracing::info!(url = %target, "remote navigation");
                    }),
                    None => {
                        let _ = reply.send(Err(CommandError::NotReady));
                        return;
                    }
                };
                let _ = reply.send(self.finish_command(result).await);
            }
            CaptureCommand::Click { selector, reply } => {
                let result = match self.session.as_ref() {
                    Some(session) => session.click(&selector).await,
                    None => {
                        let _ = reply.send(Err(CommandError::NotReady));
                        return;
                    }
                };
                let _ = reply.send(self.finish_command(result).await);
            }
            CaptureCommand::Fill {
                selector,
                value,
                reply,
            } => {
                let result = match self.session.as_ref() {
                    Some(session) => session.fill(&selector, &value).await,
                    None => {
                        let _ = reply.send(Err(CommandError::NotReady));
                        return;
                    }
                };
                let _ = reply.send(self.finish_command(result).await);
            }
        }
    }

    /// Map a command outcome and refresh the snapshot so the dashboard shows its effect.
    async fn finish_command(&mut self, result: Result<(), SessionError>) -> Result<(), CommandError> {
        match result {
            Ok(()) => {
                self.capture().await;
                Ok(())
            }
            Err(SessionError::Target(err)) => Err(CommandError::Rejected(err.to_string())),
            Err(err) => {
                if err.requires_new_session() {
                    self.record_failure(&err).await;
                }
                Err(CommandError::Failed(err.to_string()))
            }
        }
    }
}

/// Log in once, capture once, close. Used by the `snapshot` subcommand.
pub async fn capture_once(
    config: &Config,
    credentials: &Credentials,
    mode: CaptureMode,
) -> Result<crate::model::Snapshot, SessionError> {
    let launcher = ChromeLauncher::new(config.browser.clone());
    let mut session = RouterSession::open(&launcher, config, credentials).await?;
    let result = session.capture(mode).await;
    session.close().await;
    result
}

pub async fn send_command<F>(tx: &CommandSender, build: F) -> Result<(), CommandError>
where
    F: FnOnce(CommandReply) -> CaptureCommand,
{
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(build(reply_tx))
        .await
        .map_err(|_| CommandError::WorkerGone)?;
    reply_rx.await.map_err(|_| CommandError::WorkerGone)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::fake::{FakeLauncher, FakePage};
    use crate::page::PageError;

    #[test]
    fn backoff_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(5000));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn backoff_reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(30_000));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.capture.max_failures = 2;
        config
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "Admin".to_string(),
            password: Some("secret".to_string()),
        }
    }

    fn worker_with(launcher: FakeLauncher) -> (CaptureWorker, watch::Receiver<BridgeFrame>) {
        let (tx, rx) = watch::channel(BridgeFrame::default());
        let worker = CaptureWorker::new(test_config(), credentials(), tx, Arc::new(launcher));
        (worker, rx)
    }

    fn worker() -> (CaptureWorker, watch::Receiver<BridgeFrame>) {
        worker_with(FakeLauncher::failing())
    }

    #[tokio::test]
    async fn failures_publish_error_and_schedule_retry() {
        let (mut worker, rx) = worker();
        worker.record_failure(&SessionError::LoginRejected).await;

        let frame = rx.borrow().clone();
        assert_eq!(frame.status, SessionStatus::Error);
        assert_eq!(frame.consecutive_failures, 1);
        assert_eq!(frame.message.as_deref(), Some("router rejected the login"));
        assert!(!frame.logged_in);
        assert!(worker.retry_at.is_some());
    }

    #[tokio::test]
    async fn retry_delay_grows_with_each_failure() {
        let (mut worker, _rx) = worker();
        let err = SessionError::Page(PageError::ElementNotFound("#x".into()));
        worker.record_failure(&err).await;
        let first = worker.retry_at.unwrap();
        worker.record_failure(&err).await;
        let second = worker.retry_at.unwrap();
        assert!(second > first);
        assert_eq!(worker.failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_launches_retry_on_backoff_not_interval() {
        let launcher = FakeLauncher::failing();
        let mut config = test_config();
        config.capture.interval_ms = 10_000;
        config.capture.backoff_initial_ms = 100;
        config.capture.backoff_max_ms = 10_000;
        let (tx, _rx) = watch::channel(BridgeFrame::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (_cmd_tx, handle) =
            spawn_with(Arc::new(launcher.clone()), config, credentials(), tx, shutdown_rx);
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Attempts at 0, 100, 300 and 700 ms.
        assert_eq!(launcher.opened(), 4);
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn tick_logs_in_and_publishes_snapshot() {
        let page = FakePage::login_form();
        let (mut worker, rx) = worker_with(FakeLauncher::new(page));
        worker.tick().await;

        let frame = rx.borrow().clone();
        assert_eq!(frame.status, SessionStatus::Ready);
        assert!(frame.logged_in);
        assert!(frame.session_started_unix.is_some());
        assert_eq!(frame.snapshot.unwrap().url, "http://fritz.box/#/mesh");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_drop_and_close_the_session() {
        let page = FakePage::login_form();
        let (mut worker, rx) = worker_with(FakeLauncher::new(page.clone()));
        worker.tick().await;

        page.state().fail_screenshot = true;
        worker.tick().await;
        assert!(worker.session.is_some());
        assert!(!page.state().closed);

        worker.tick().await;
        assert!(worker.session.is_none());
        assert!(page.state().closed);
        let frame = rx.borrow().clone();
        assert_eq!(frame.consecutive_failures, 2);
        assert!(!frame.logged_in);
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_failure_count() {
        let page = FakePage::login_form();
        let (mut worker, rx) = worker_with(FakeLauncher::new(page.clone()));
        worker.tick().await;

        page.state().fail_screenshot = true;
        worker.tick().await;
        assert_eq!(worker.failures, 1);

        page.state().fail_screenshot = false;
        worker.tick().await;
        assert_eq!(worker.failures, 0);
        assert!(worker.retry_at.is_none());
        assert_eq!(rx.borrow().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_is_replaced_on_next_tick() {
        let page = FakePage::login_form();
        let launcher = FakeLauncher::new(page.clone());
        let (mut worker, rx) = worker_with(launcher.clone());
        worker.tick().await;

        page.show_login_form();
        worker.tick().await;
        assert!(worker.session.is_none());
        assert!(page.state().closed);
        assert_eq!(rx.borrow().message.as_deref(), Some("router session expired"));

        worker.tick().await;
        assert_eq!(launcher.opened(), 2);
        assert_eq!(rx.borrow().status, SessionStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_browser_triggers_a_new_session() {
        let page = FakePage::login_form();
        let launcher = FakeLauncher::new(page.clone());
        let (mut worker, rx) = worker_with(launcher.clone());
        worker.tick().await;

        page.state().alive = false;
        worker.tick().await;
        assert_eq!(launcher.opened(), 2);
        assert!(rx.borrow().logged_in);
    }

    #[tokio::test(start_paused = true)]
    async fn navigate_command_refreshes_snapshot() {
        let page = FakePage::login_form();
        let (mut worker, rx) = worker_with(FakeLauncher::new(page));
        worker.tick().await;

        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .handle(CaptureCommand::Navigate {
                url: "#/wlan".to_string(),
                reply: reply_tx,
            })
            .await;
        assert!(reply_rx.await.unwrap().is_ok());
        assert_eq!(
            rx.borrow().snapshot.as_ref().unwrap().url,
            "http://fritz.box/#/wlan"
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .handle(CaptureCommand::Navigate {
                url: "http://example.com/".to_string(),
                reply: reply_tx,
            })
            .await;
        assert!(matches!(reply_rx.await.unwrap(), Err(CommandError::Rejected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn relogin_replaces_the_session() {
        let page = FakePage::login_form();
        let launcher = FakeLauncher::new(page);
        let (mut worker, _rx) = worker_with(launcher.clone());
        worker.tick().await;

        let (reply_tx, reply_rx) = oneshot::channel();
        worker.handle(CaptureCommand::Relogin { reply: reply_tx }).await;
        assert!(reply_rx.await.unwrap().is_ok());
        assert_eq!(launcher.opened(), 2);
    }

    #[tokio::test]
    async fn commands_without_session_are_not_ready() {
        let (mut worker, _rx) = worker();
        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .handle(CaptureCommand::Click {
                selector: "#uiNav".to_string(),
                reply: reply_tx,
            })
            .await;
        assert!(matches!(reply_rx.await.unwrap(), Err(CommandError::NotReady)));
    }

    #[tokio::test]
    async fn stopped_worker_reports_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let err = send_command(&tx, |reply| CaptureCommand::Relogin { reply })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::WorkerGone));
    }

    #[test]
    fn worker_publishes_configured_mode() {
        let (tx, rx) = watch::channel(BridgeFrame::default());
        let mut config = Config::default();
        config.capture.mode = CaptureMode::Live;
        let _worker = CaptureWorker::new(
            config,
            credentials(),
            tx,
            Arc::new(FakeLauncher::failing()),
        );
        assert_eq!(rx.borrow().mode, CaptureMode::Live);
    }
}
