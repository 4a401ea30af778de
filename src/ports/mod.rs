//! Capability interfaces consumed by the controller core.
//!
//! Implementations of these traits live at the edges (or in tests); the
//! core only ever talks to the trait objects collected in [`Ports`].

pub mod acct;
pub mod auth;
pub mod priority;
pub mod switchplug;
pub mod topo;

use std::sync::Arc;

pub use acct::{AccountingSink, LogAccounting};
pub use auth::{AuthIdentity, AuthPlugin, TokenAuth};
pub use priority::{MultifactorLite, PriorityFactors, PriorityPlugin};
pub use switchplug::{NullSwitch, SwitchPlugin};
pub use topo::{TopologyPlugin, WeightOrderTopology};

/// Bundle of collaborator implementations handed to the controller at
/// startup.
pub struct Ports {
    pub auth: Arc<dyn AuthPlugin>,
    pub acct: Arc<dyn AccountingSink>,
    pub priority: Arc<dyn PriorityPlugin>,
    pub topo: Arc<dyn TopologyPlugin>,
    pub switch: Arc<dyn SwitchPlugin>,
}

impl Ports {
    /// Default wiring: token auth keyed from the credential key, logging
    /// accounting, multifactor-lite priority, weight-order topology, no
    /// switch data.
    pub fn defaults(auth_key: &str) -> Self {
        Self {
            auth: Arc::new(TokenAuth::new(auth_key)),
            acct: Arc::new(LogAccounting),
            priority: Arc::new(MultifactorLite::default()),
            topo: Arc::new(WeightOrderTopology),
            switch: Arc::new(NullSwitch),
        }
    }
}
