//! ssvirt-reconciler: control loops that keep the SSVirt database and the
//! KubeVirt cluster convergent.
//!
//! VDCs and Organizations are projected onto namespaces (plus quota and
//! network policy for VDCs); VirtualMachines and TemplateInstances are
//! projected back onto VM and vApp rows.

pub mod cluster;
pub mod controller;
pub mod crd;
pub mod error;
pub mod helpers;
pub mod metrics;
pub mod postgres;
pub mod store;
