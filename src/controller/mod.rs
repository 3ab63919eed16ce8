//! Reconcilers.
//!
//! VM and vApp controllers are driven by `kube::runtime::Controller`;
//! VDC and Organization controllers by the keyed queue in [`runner`].
//! All of them share one [`Context`].

use std::sync::Arc;

use crate::cluster::ClusterClient;
use crate::helpers::ControllerSettings;
use crate::metrics::Metrics;
use crate::store::Repositories;

pub mod helpers;
pub mod labels;
pub mod namespace;
pub mod organization;
pub mod resolver;
pub mod runner;
pub mod status_mapper;
pub mod vapp_evaluator;
pub mod vapp_status;
pub mod vdc;
pub mod vm_data;
pub mod vm_status;

// ── Shared context passed to every reconcile call ─────────────────────────────

pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub repos: Repositories,
    pub metrics: Arc<dyn Metrics>,
    pub settings: ControllerSettings,
}
