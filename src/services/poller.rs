//! Cloud Poller: token-aware wrappers around the cloud API.
//!
//! Every call takes its credential from the Session Manager. A 401 answer
//! invalidates that credential and the call is repeated once with a fresh
//! one; the refresh itself is shared with any concurrent caller.

use log::{debug, warn};
use std::fmt;
use std::sync::Arc;

use crate::client::{CloudApi, CloudError};
use crate::models::cloud::{InstallationId, InstallationSnapshot, InstallationSummary, LiveSnapshot};
use crate::referential::ReferentialTable;
use crate::session::{AccessToken, SessionError, SessionManager};
use crate::translator::CloudCommand;

#[derive(Debug)]
pub enum PollError {
    Session(SessionError),
    Cloud(CloudError),
}

impl PollError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PollError::Session(e) if e.is_fatal())
    }
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Session(e) => write!(f, "session: {}", e),
            PollError::Cloud(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PollError {}

impl From<SessionError> for PollError {
    fn from(value: SessionError) -> Self {
        PollError::Session(value)
    }
}

impl From<CloudError> for PollError {
    fn from(value: CloudError) -> Self {
        PollError::Cloud(value)
    }
}

pub struct CloudPoller {
    api: Arc<dyn CloudApi>,
    session: Arc<SessionManager>,
}

impl CloudPoller {
    pub fn new(api: Arc<dyn CloudApi>, session: Arc<SessionManager>) -> Self {
        CloudPoller { api, session }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    fn with_token<T>(&self, what: &str, call: impl Fn(&AccessToken) -> Result<T, CloudError>) -> Result<T, PollError> {
        let token = self.session.access_token()?;
        match call(&token) {
            Err(CloudError::Unauthorized) => {
                debug!("Poll: {} answered 401, retrying with a new token", what);
                self.session.invalidate(&token);
                let token = self.session.access_token()?;
                Ok(call(&token)?)
            }
            other => Ok(other?),
        }
    }

    pub fn list_installations(&self) -> Result<Vec<InstallationSummary>, PollError> {
        self.with_token("installation listing", |t| self.api.list_installations(t))
    }

    pub fn fetch_installation(&self, id: &InstallationId) -> Result<InstallationSnapshot, PollError> {
        let snapshot = self.with_token("installation fetch", |t| self.api.fetch_installation(t, id))?;
        for skipped in &snapshot.skipped {
            warn!("Poll: {}: skipped malformed entry {}", id, skipped);
        }
        debug!(
            "Poll: {}: {} zone(s), {} channel(s)",
            id,
            snapshot.zones.len(),
            snapshot.channels.len()
        );
        Ok(snapshot)
    }

    pub fn fetch_live_data(&self, id: &InstallationId) -> Result<LiveSnapshot, PollError> {
        self.with_token("live data fetch", |t| self.api.fetch_live_data(t, id))
    }

    pub fn fetch_referential(&self) -> Result<ReferentialTable, PollError> {
        self.with_token("referential fetch", |t| self.api.fetch_referential(t))
    }

    pub fn send_command(&self, command: &CloudCommand) -> Result<(), PollError> {
        self.with_token("command", |t| self.api.send_command(t, command))
    }
}
