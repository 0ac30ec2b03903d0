//! Session lifecycle and the authorized-request protocol
//!
//! One [`SessionManager`] owns the session of a client. Clones share the
//! same state. Every mutation replaces the whole [`Session`] value,
//! increments a generation counter and is published on a `watch` channel.
//!
//! Refreshes are single-flight: a caller passes the generation it last
//! observed, and if the session moved on while it waited for the refresh
//! gate, it reuses that outcome instead of calling the server again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use folio_core::{AuthError, ClientError};
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::{Credentials, SessionApi, SessionResponse, auth_error, read_error};
use crate::session::{Session, SessionFile, SessionState};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Token lifetime assumptions used to schedule proactive refreshes.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Assumed lifetime of an access token.
    pub lifetime: Duration,
    /// How long before expiry the refresh fires.
    pub lead: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(15 * 60),
            lead: Duration::from_secs(60),
        }
    }
}

/// Shortest delay between scheduled refreshes.
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

impl SessionConfig {
    /// `lifetime - lead`, never shorter than [`MIN_REFRESH_DELAY`].
    pub fn refresh_delay(&self) -> Duration {
        self.lifetime
            .saturating_sub(self.lead)
            .max(MIN_REFRESH_DELAY)
    }
}

struct Current {
    session: Session,
    generation: u64,
    /// Error that produced the current generation, if a failure cleared it.
    last_failure: Option<(u64, ClientError)>,
}

struct RefreshTimer {
    cycle: u64,
    task: JoinHandle<()>,
}

struct Inner {
    api: Arc<dyn SessionApi>,
    config: SessionConfig,
    file: Option<SessionFile>,
    current: Mutex<Current>,
    session_tx: watch::Sender<Session>,
    state_tx: watch::Sender<SessionState>,
    /// Serializes refresh, login, logout and invalidation.
    refresh_gate: tokio::sync::Mutex<()>,
    timer: Mutex<Option<RefreshTimer>>,
    cycles: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.timer).take() {
            timer.task.abort();
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(api: Arc<dyn SessionApi>, config: SessionConfig, file: Option<SessionFile>) -> Self {
        let (session_tx, _) = watch::channel(Session::default());
        let (state_tx, _) = watch::channel(SessionState::LoggedOut);
        Self {
            inner: Arc::new(Inner {
                api,
                config,
                file,
                current: Mutex::new(Current {
                    session: Session::default(),
                    generation: 0,
                    last_failure: None,
                }),
                session_tx,
                state_tx,
                refresh_gate: tokio::sync::Mutex::new(()),
                timer: Mutex::new(None),
                cycles: AtomicU64::new(0),
            }),
        }
    }

    pub fn api(&self) -> &dyn SessionApi {
        self.inner.api.as_ref()
    }

    pub fn session(&self) -> Session {
        lock(&self.inner.current).session.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.inner.session_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Load the persisted session, if any. Returns whether one was found.
    ///
    /// No refresh is scheduled: the age of a restored access token is
    /// unknown, so an expired one is recovered on its first 401.
    pub async fn restore(&self) -> Result<bool, ClientError> {
        let Some(file) = &self.inner.file else {
            return Ok(false);
        };
        let Some(session) = file.load().await? else {
            return Ok(false);
        };
        if session.is_empty() {
            return Ok(false);
        }

        let _gate = self.inner.refresh_gate.lock().await;
        let state = if session.access_token.is_some() {
            SessionState::LoggedIn
        } else {
            SessionState::LoggedOut
        };
        self.replace(session, None);
        self.inner.state_tx.send_replace(state);
        log::debug!("restored session from {}", file.path().display());
        Ok(true)
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<Session, ClientError> {
        let _gate = self.inner.refresh_gate.lock().await;
        log::debug!("logging in as {}", credentials.email);
        let resp = self.inner.api.login(credentials).await?;
        let (_, session) = self.install(resp).await;
        if let Some(user) = &session.user {
            log::info!("logged in as {}", user.username);
        }
        Ok(session)
    }

    /// Exchange the refresh token for a new session.
    ///
    /// Any failure clears the session.
    pub async fn refresh(&self) -> Result<Session, ClientError> {
        let seen = self.generation();
        self.refresh_after(seen).await.map(|(_, session)| session)
    }

    /// Send a request with the current access token as bearer.
    ///
    /// Without an access token, refreshes first. A 401 triggers exactly one
    /// refresh and one retry; a 401 on the retry is returned as
    /// [`AuthError::Unauthorized`] and ends the session. Every other response
    /// is returned as is.
    pub async fn authorized_call<F>(&self, build: F) -> Result<Response, ClientError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let (mut generation, mut token) = match self.current_token() {
            (generation, Some(token)) => (generation, token),
            (seen, None) => {
                log::debug!("no access token, refreshing before request");
                let (generation, session) = self.refresh_after(seen).await?;
                (generation, access_token(&session)?)
            }
        };
        let mut refreshed = false;

        loop {
            let resp = build(self.inner.api.http())
                .bearer_auth(&token)
                .send()
                .await
                .map_err(ClientError::from_reqwest)?;
            if resp.status() != StatusCode::UNAUTHORIZED {
                return Ok(resp);
            }

            if refreshed {
                let (_, message) = read_error(resp).await;
                log::warn!("request rejected after refresh: {message}");
                let err = ClientError::from(AuthError::Unauthorized(message));
                self.invalidate(generation, err.clone()).await;
                return Err(err);
            }

            log::debug!("access token rejected, refreshing");
            let (next, session) = self.refresh_after(generation).await?;
            generation = next;
            token = access_token(&session)?;
            refreshed = true;
        }
    }

    /// Notify the server (best effort), then clear the local session.
    pub async fn logout(&self) {
        let _gate = self.inner.refresh_gate.lock().await;
        if let Some(token) = self.session().refresh_token {
            if let Err(e) = self.inner.api.logout(&token).await {
                log::warn!("logout notification failed: {e}");
            }
        }
        self.clear(None).await;
        log::info!("logged out");
    }

    /// Check the access token against the server.
    pub async fn verify(&self) -> Result<(), ClientError> {
        let url = self.inner.api.endpoint(&["auth", "verify"])?;
        let resp = self.authorized_call(|client| client.get(url.clone())).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(auth_error(resp).await)
        }
    }

    /// `true` if an access token is present or one refresh produced one.
    pub async fn ensure_session(&self) -> bool {
        let session = self.session();
        if session.access_token.is_some() {
            return true;
        }
        if !session.can_refresh() {
            return false;
        }
        match self.refresh().await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("session could not be restored: {e}");
                false
            }
        }
    }

    fn generation(&self) -> u64 {
        lock(&self.inner.current).generation
    }

    fn current_token(&self) -> (u64, Option<String>) {
        let current = lock(&self.inner.current);
        (current.generation, current.session.access_token.clone())
    }

    /// Refresh unless the session changed since generation `seen`.
    async fn refresh_after(&self, seen: u64) -> Result<(u64, Session), ClientError> {
        let _gate = self.inner.refresh_gate.lock().await;

        let previous = {
            let current = lock(&self.inner.current);
            if current.generation != seen {
                if current.session.access_token.is_some() {
                    log::debug!("reusing session refreshed by a concurrent caller");
                    return Ok((current.generation, current.session.clone()));
                }
                if let Some((generation, e)) = &current.last_failure {
                    if *generation == current.generation {
                        return Err(e.clone());
                    }
                }
            }
            current.session.clone()
        };

        let Some(refresh_token) = previous.refresh_token else {
            let err = ClientError::from(AuthError::MissingRefreshToken);
            self.clear(Some(err.clone())).await;
            return Err(err);
        };

        self.inner.state_tx.send_replace(SessionState::Refreshing);
        match self.inner.api.refresh_token(&refresh_token).await {
            Ok(resp) => {
                let installed = self.install(resp).await;
                log::info!("session refreshed");
                Ok(installed)
            }
            Err(e) => {
                log::warn!("session refresh failed: {e}");
                self.clear(Some(e.clone())).await;
                Err(e)
            }
        }
    }

    /// Replace the session after an accepted login or refresh. Caller holds the gate.
    async fn install(&self, resp: SessionResponse) -> (u64, Session) {
        let (generation, session) = {
            let previous = self.session();
            let session = Session::from_response(resp, &previous);
            (self.replace(session.clone(), None), session)
        };
        self.inner.state_tx.send_replace(SessionState::LoggedIn);
        self.persist(&session).await;
        schedule_refresh(&self.inner);
        (generation, session)
    }

    /// Drop the session entirely. Caller holds the gate.
    async fn clear(&self, failure: Option<ClientError>) {
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.task.abort();
        }
        self.replace(Session::default(), failure);
        self.inner.state_tx.send_replace(SessionState::LoggedOut);
        if let Some(file) = &self.inner.file {
            if let Err(e) = file.remove().await {
                log::warn!("could not remove saved session: {e}");
            }
        }
    }

    /// Clear the session if it is still the one at `generation`.
    async fn invalidate(&self, generation: u64, err: ClientError) {
        let _gate = self.inner.refresh_gate.lock().await;
        if self.generation() == generation {
            self.clear(Some(err)).await;
        }
    }

    fn replace(&self, session: Session, failure: Option<ClientError>) -> u64 {
        let mut current = lock(&self.inner.current);
        current.generation += 1;
        let generation = current.generation;
        current.last_failure = failure.map(|e| (generation, e));
        current.session = session.clone();
        self.inner.session_tx.send_replace(session);
        generation
    }

    async fn persist(&self, session: &Session) {
        if let Some(file) = &self.inner.file {
            if let Err(e) = file.save(session).await {
                log::warn!("could not save session: {e}");
            }
        }
    }
}

fn access_token(session: &Session) -> Result<String, ClientError> {
    session
        .access_token
        .clone()
        .ok_or_else(|| AuthError::InvalidSession("no access token after refresh".into()).into())
}

/// Arm the one-shot refresh timer, cancelling the previous one.
fn schedule_refresh(inner: &Arc<Inner>) {
    let delay = inner.config.refresh_delay();
    let cycle = inner.cycles.fetch_add(1, Ordering::Relaxed) + 1;
    let weak: Weak<Inner> = Arc::downgrade(inner);

    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        {
            let mut timer = lock(&inner.timer);
            if !timer.as_ref().is_some_and(|t| t.cycle == cycle) {
                return;
            }
            // Detach so the refresh below can arm the next cycle
            timer.take();
        }
        log::debug!("refresh cycle {cycle} firing");
        let manager = SessionManager { inner };
        if let Err(e) = manager.refresh().await {
            log::warn!("scheduled refresh failed: {e}");
        }
    });

    log::debug!("refresh cycle {cycle} in {delay:?}");
    if let Some(previous) = lock(&inner.timer).replace(RefreshTimer { cycle, task }) {
        previous.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;
    use reqwest::Url;

    use crate::session::User;

    #[derive(Default)]
    struct FakeApi {
        client: reqwest::Client,
        logins: AtomicUsize,
        refreshes: AtomicUsize,
        logouts: AtomicUsize,
        fail_refresh: AtomicBool,
        fail_logout: bool,
        refresh_delay: Duration,
    }

    fn user() -> User {
        User {
            id: 1,
            username: "reader".into(),
            email: "reader@example.com".into(),
            email_verified: true,
            roles: String::new(),
        }
    }

    #[async_trait]
    impl SessionApi for FakeApi {
        fn http(&self) -> &reqwest::Client {
            &self.client
        }

        fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
            Ok(Url::parse(&format!("http://fake.invalid/{}", segments.join("/"))).unwrap())
        }

        async fn login(&self, credentials: &Credentials) -> Result<SessionResponse, ClientError> {
            if credentials.password != "secret" {
                return Err(AuthError::InvalidCredentials("Invalid email or password".into()).into());
            }
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SessionResponse {
                access_token: format!("login-access-{n}"),
                refresh_token: Some(format!("login-refresh-{n}")),
                user: user(),
            })
        }

        async fn refresh_token(&self, _refresh_token: &str) -> Result<SessionResponse, ClientError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.refresh_delay.is_zero() {
                tokio::time::sleep(self.refresh_delay).await;
            }
            if self.fail_refresh.load(Ordering::SeqCst) {
                return Err(AuthError::Unauthorized("refresh token expired".into()).into());
            }
            Ok(SessionResponse {
                access_token: format!("access-{n}"),
                refresh_token: None,
                user: user(),
            })
        }

        async fn logout(&self, _refresh_token: &str) -> Result<(), ClientError> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            if self.fail_logout {
                return Err(ClientError::network("connection refused"));
            }
            Ok(())
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            email: "reader@example.com".into(),
            password: "secret".into(),
        }
    }

    fn manager(api: &Arc<FakeApi>) -> SessionManager {
        SessionManager::new(api.clone(), SessionConfig::default(), None)
    }

    fn refreshes(api: &FakeApi) -> usize {
        api.refreshes.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn login_schedules_refresh_before_expiry() {
        let api = Arc::new(FakeApi::default());
        let manager = manager(&api);

        let session = manager.login(&credentials()).await.unwrap();
        assert_eq!(session.access_token.as_deref(), Some("login-access-1"));
        assert_eq!(manager.state(), SessionState::LoggedIn);

        tokio::time::sleep(Duration::from_secs(839)).await;
        assert_eq!(refreshes(&api), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(refreshes(&api), 1);
        let session = manager.session();
        assert_eq!(session.access_token.as_deref(), Some("access-1"));
        // Refresh response had no refresh token
        assert_eq!(session.refresh_token.as_deref(), Some("login-refresh-1"));

        // The refresh armed the next cycle
        tokio::time::sleep(Duration::from_secs(840)).await;
        assert_eq!(refreshes(&api), 2);
    }

    #[test]
    fn refresh_delay_has_a_floor() {
        let config = SessionConfig {
            lifetime: Duration::from_secs(60),
            lead: Duration::from_secs(60),
        };
        assert_eq!(config.refresh_delay(), MIN_REFRESH_DELAY);
        assert_eq!(SessionConfig::default().refresh_delay(), Duration::from_secs(840));
    }

    #[tokio::test(start_paused = true)]
    async fn lead_longer_than_lifetime_does_not_spin() {
        let api = Arc::new(FakeApi::default());
        let config = SessionConfig {
            lifetime: Duration::from_secs(60),
            lead: Duration::from_secs(120),
        };
        let manager = SessionManager::new(api.clone(), config, None);

        manager.login(&credentials()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(refreshes(&api), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(refreshes(&api), 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(refreshes(&api), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relogin_cancels_previous_cycle() {
        let api = Arc::new(FakeApi::default());
        let manager = manager(&api);

        manager.login(&credentials()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(500)).await;
        manager.login(&credentials()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(refreshes(&api), 0);

        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(refreshes(&api), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_are_single_flight() {
        let api = Arc::new(FakeApi {
            refresh_delay: Duration::from_millis(50),
            ..Default::default()
        });
        let manager = manager(&api);
        manager.login(&credentials()).await.unwrap();

        let results =
            futures_util::future::join_all((0..5).map(|_| manager.refresh())).await;

        assert_eq!(refreshes(&api), 1);
        for result in results {
            assert_eq!(result.unwrap().access_token.as_deref(), Some("access-1"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_refreshes_each_call_server() {
        let api = Arc::new(FakeApi::default());
        let manager = manager(&api);
        manager.login(&credentials()).await.unwrap();

        manager.refresh().await.unwrap();
        let session = manager.refresh().await.unwrap();
        assert_eq!(refreshes(&api), 2);
        assert_eq!(session.access_token.as_deref(), Some("access-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_share_refresh_failure() {
        let api = Arc::new(FakeApi {
            refresh_delay: Duration::from_millis(50),
            ..Default::default()
        });
        api.fail_refresh.store(true, Ordering::SeqCst);
        let manager = manager(&api);
        manager.login(&credentials()).await.unwrap();

        let results =
            futures_util::future::join_all((0..3).map(|_| manager.refresh())).await;

        assert_eq!(refreshes(&api), 1);
        for result in results {
            assert!(matches!(
                result,
                Err(ClientError::Authentication(AuthError::Unauthorized(_)))
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_clears_session() {
        let api = Arc::new(FakeApi::default());
        let manager = manager(&api);
        manager.login(&credentials()).await.unwrap();
        let mut rx = manager.subscribe();
        rx.borrow_and_update();

        api.fail_refresh.store(true, Ordering::SeqCst);
        let err = manager.refresh().await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.session().is_empty());
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow().is_empty());

        // Cleared session also disarmed the timer
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(refreshes(&api), 1);
    }

    #[tokio::test]
    async fn refresh_without_token_fails_fast() {
        let api = Arc::new(FakeApi::default());
        let manager = manager(&api);

        let err = manager.refresh().await.unwrap_err();
        assert_eq!(err, ClientError::from(AuthError::MissingRefreshToken));
        assert_eq!(refreshes(&api), 0);
    }

    #[tokio::test]
    async fn failed_login_stays_logged_out() {
        let api = Arc::new(FakeApi::default());
        let manager = manager(&api);
        let bad = Credentials {
            password: "wrong".into(),
            ..credentials()
        };

        let err = manager.login(&bad).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.session().is_empty());
    }

    #[tokio::test]
    async fn logout_clears_even_when_notification_fails() {
        let api = Arc::new(FakeApi {
            fail_logout: true,
            ..Default::default()
        });
        let manager = manager(&api);
        manager.login(&credentials()).await.unwrap();

        manager.logout().await;
        assert_eq!(api.logouts.load(Ordering::SeqCst), 1);
        assert!(manager.session().is_empty());
        assert_eq!(manager.state(), SessionState::LoggedOut);
    }

    #[tokio::test]
    async fn session_persists_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let api = Arc::new(FakeApi::default());

        let first = SessionManager::new(
            api.clone(),
            SessionConfig::default(),
            Some(SessionFile::new(&path)),
        );
        let session = first.login(&credentials()).await.unwrap();
        assert!(path.exists());

        let second = SessionManager::new(
            api.clone(),
            SessionConfig::default(),
            Some(SessionFile::new(&path)),
        );
        assert!(second.restore().await.unwrap());
        assert_eq!(second.session(), session);
        assert_eq!(second.state(), SessionState::LoggedIn);

        second.logout().await;
        assert!(!path.exists());

        let third = SessionManager::new(api, SessionConfig::default(), Some(SessionFile::new(&path)));
        assert!(!third.restore().await.unwrap());
    }

    #[tokio::test]
    async fn ensure_session_refreshes_once_when_needed() {
        let api = Arc::new(FakeApi::default());
        let manager = manager(&api);
        assert!(!manager.ensure_session().await);
        assert_eq!(refreshes(&api), 0);

        manager.login(&credentials()).await.unwrap();
        assert!(manager.ensure_session().await);
        assert_eq!(refreshes(&api), 0);

        // Refresh token only
        let dir = tempfile::tempdir().unwrap();
        let file = SessionFile::new(dir.path().join("session.json"));
        file.save(&Session {
            refresh_token: Some("r".into()),
            ..Default::default()
        })
        .await
        .unwrap();
        let manager = SessionManager::new(api.clone(), SessionConfig::default(), Some(file));
        assert!(manager.restore().await.unwrap());
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.ensure_session().await);
        assert_eq!(refreshes(&api), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_manager_stops_timer() {
        let api = Arc::new(FakeApi::default());
        let manager = manager(&api);
        manager.login(&credentials()).await.unwrap();
        drop(manager);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(refreshes(&api), 0);
    }
}
