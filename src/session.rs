//! Session Manager: owns the access credential and its refresh cycle.
//!
//! ```text
//! Unauthenticated --login--> Authenticated --tick--> RefreshPending --ok--> Authenticated
//!                                                    RefreshPending --refresh rejected--> one full login
//! ```
//!
//! Only one refresh or login is in flight at a time. Callers that need a
//! credential while one is in flight block on a condition variable until the
//! leader finishes, then read its result instead of starting a second one.

use log::{debug, info, warn};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::client::{CloudApi, CloudError};

/// Treat tokens as expired slightly early so a request never races the expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(15);
/// Upper bound on any lifetime the token endpoint hands out.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(30 * 24 * 3600);

fn deadline(now: Instant, lifetime: Duration) -> Instant {
    now.checked_add(lifetime.min(MAX_TOKEN_LIFETIME)).unwrap_or(now)
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opaque bearer credential handed to the poller.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        AccessToken(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(<{} bytes>)", self.0.len())
    }
}

pub struct Session {
    access: AccessToken,
    expires_at: Instant,
    refresh_token: Option<String>,
    refresh_expires_at: Option<Instant>,
}

impl Session {
    pub fn new(
        access_token: impl Into<String>,
        expires_in: Duration,
        refresh_token: Option<String>,
        refresh_expires_in: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        Session {
            access: AccessToken::new(access_token),
            expires_at: deadline(now, expires_in),
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            refresh_expires_at: refresh_expires_in.map(|d| deadline(now, d)),
        }
    }

    pub fn access_token(&self) -> &AccessToken {
        &self.access
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now + EXPIRY_MARGIN >= self.expires_at
    }

    /// A refresh token we already know is dead is not worth a round trip.
    fn usable_refresh_token(&self, now: Instant) -> Option<&str> {
        match self.refresh_expires_at {
            Some(at) if now >= at => None,
            _ => self.refresh_token(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access", &self.access)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum SessionError {
    /// No valid credential right now; the next refresh tick will try again.
    Unavailable,
    /// Full login rejected the configured credentials.
    Auth(String),
    Cloud(CloudError),
    /// Consecutive fallback logins were rejected; the process cannot recover.
    Exhausted(u32),
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Exhausted(_))
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Unavailable => write!(f, "no valid session (waiting for next login attempt)"),
            SessionError::Auth(e) => write!(f, "authentication failed: {}", e),
            SessionError::Cloud(e) => write!(f, "{}", e),
            SessionError::Exhausted(n) => write!(f, "giving up after {} rejected logins", n),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Cloud(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CloudError> for SessionError {
    fn from(value: CloudError) -> Self {
        match value {
            CloudError::Auth(msg) => SessionError::Auth(msg),
            other => SessionError::Cloud(other),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    RefreshPending,
}

struct Inner {
    state: SessionState,
    session: Option<Session>,
    login_failures: u32,
}

enum Cycle {
    Session(Session),
    RefreshFailed(CloudError),
    LoginFailed(CloudError),
}

pub struct SessionManager {
    api: Arc<dyn CloudApi>,
    credentials: Credentials,
    max_login_failures: u32,
    inner: Mutex<Inner>,
    settled: Condvar,
}

impl SessionManager {
    pub fn new(api: Arc<dyn CloudApi>, credentials: Credentials, max_login_failures: u32) -> Self {
        SessionManager {
            api,
            credentials,
            max_login_failures: max_login_failures.max(1),
            inner: Mutex::new(Inner {
                state: SessionState::Unauthenticated,
                session: None,
                login_failures: 0,
            }),
            settled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking holder cannot leave Inner half-written; keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait out any in-flight cycle. Returns `true` if one was awaited.
    fn settle<'a>(&self, mut inner: MutexGuard<'a, Inner>) -> (MutexGuard<'a, Inner>, bool) {
        let mut waited = false;
        while inner.state == SessionState::RefreshPending {
            waited = true;
            inner = self.settled.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
        (inner, waited)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Full login at startup. An `Auth` error here means the configuration
    /// is wrong and should stop the process.
    pub fn authenticate(&self) -> Result<(), SessionError> {
        let (inner, _) = self.settle(self.lock());
        self.lead(inner, true)
    }

    /// Scheduled refresh. Falls back to exactly one full login when the
    /// refresh token is rejected or there is no session at all.
    pub fn refresh_tick(&self) -> Result<(), SessionError> {
        let (inner, waited) = self.settle(self.lock());
        if waited {
            debug!("Session: refresh already performed by a concurrent caller");
            return Ok(());
        }
        let force_login = inner.state == SessionState::Unauthenticated;
        self.lead(inner, force_login)
    }

    /// Current access credential, refreshing it first if it has expired.
    pub fn access_token(&self) -> Result<AccessToken, SessionError> {
        let (inner, _) = self.settle(self.lock());
        match (&inner.state, &inner.session) {
            (SessionState::Authenticated, Some(s)) if !s.is_expired(Instant::now()) => {
                return Ok(s.access_token().clone());
            }
            (SessionState::Authenticated, Some(_)) => {}
            _ => return Err(SessionError::Unavailable),
        }

        debug!("Session: access token expired, refreshing on demand");
        self.lead(inner, false)?;
        let inner = self.lock();
        match &inner.session {
            Some(s) if inner.state == SessionState::Authenticated => Ok(s.access_token().clone()),
            _ => Err(SessionError::Unavailable),
        }
    }

    /// Mark `token` as no longer valid (the cloud answered 401). A newer
    /// token obtained meanwhile is left alone.
    pub fn invalidate(&self, token: &AccessToken) {
        let mut inner = self.lock();
        if let Some(session) = inner.session.as_mut() {
            if session.access == *token {
                debug!("Session: access token rejected by the cloud, forcing refresh");
                session.expires_at = Instant::now();
            }
        }
    }

    /// Run one refresh/login cycle as the single in-flight leader.
    fn lead(&self, mut inner: MutexGuard<'_, Inner>, force_login: bool) -> Result<(), SessionError> {
        let refresh_token = if force_login {
            None
        } else {
            inner
                .session
                .as_ref()
                .and_then(|s| s.usable_refresh_token(Instant::now()))
                .map(str::to_owned)
        };
        inner.state = SessionState::RefreshPending;
        drop(inner);

        let cycle = self.cycle(refresh_token);

        let mut inner = self.lock();
        let result = match cycle {
            Cycle::Session(session) => {
                inner.session = Some(session);
                inner.state = SessionState::Authenticated;
                inner.login_failures = 0;
                Ok(())
            }
            Cycle::RefreshFailed(e) => {
                // Keep the old session; the next tick retries the refresh.
                inner.state = if inner.session.is_some() {
                    SessionState::Authenticated
                } else {
                    SessionState::Unauthenticated
                };
                warn!("Session: token refresh failed, retrying on next tick: {}", e);
                Err(SessionError::Cloud(e))
            }
            Cycle::LoginFailed(e) => {
                inner.session = None;
                inner.state = SessionState::Unauthenticated;
                match e {
                    CloudError::Auth(msg) => {
                        inner.login_failures += 1;
                        if inner.login_failures >= self.max_login_failures {
                            Err(SessionError::Exhausted(inner.login_failures))
                        } else {
                            warn!(
                                "Session: login rejected ({}/{}): {}",
                                inner.login_failures, self.max_login_failures, msg
                            );
                            Err(SessionError::Auth(msg))
                        }
                    }
                    other => {
                        warn!("Session: login failed, retrying on next tick: {}", other);
                        Err(SessionError::Cloud(other))
                    }
                }
            }
        };
        drop(inner);
        self.settled.notify_all();
        result
    }

    /// Network part of a cycle; runs without holding the lock.
    fn cycle(&self, refresh_token: Option<String>) -> Cycle {
        if let Some(token) = refresh_token {
            match self.api.refresh(&token) {
                Ok(session) => {
                    debug!("Session: token refreshed");
                    return Cycle::Session(session);
                }
                Err(CloudError::RefreshExpired(msg)) => {
                    warn!("Session: refresh token rejected ({}), falling back to full login", msg);
                }
                Err(e) => return Cycle::RefreshFailed(e),
            }
        }
        match self.api.login(&self.credentials) {
            Ok(session) => {
                info!("Session: logged in as {}", self.credentials.username);
                Cycle::Session(session)
            }
            Err(e) => Cycle::LoginFailed(e),
        }
    }
}
