//! OpenTofu provisioner for Stratus
//!
//! Resources are realised by running one OpenTofu module per product tag:
//!
//! ```text
//! ┌───────────────────┐   ProvisionRequest   ┌──────────────────┐
//! │ stratus-engine    │ ───────────────────▶ │ TofuProvisioner  │
//! │ (Executor)        │ ◀─────────────────── │                  │
//! └───────────────────┘   ProvisionOutcome   └────────┬─────────┘
//!                                                     │ init / apply / output / destroy
//!                                                     ▼
//!                                      <modules_dir>/<product>/  (module)
//!                                      <work_dir>/<project>/<env>/<name>/
//! ```

pub mod error;
pub mod provisioner;
pub mod tofu;

// Re-exports
pub use error::{Result, TofuError};
pub use provisioner::TofuProvisioner;
pub use tofu::Tofu;
