//! Import eligibility gate

use crate::domain::types::PhysicalObjectDescriptor;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Formats the lifecycle engine can take over
pub const SUPPORTED_FORMATS: &[&str] = &["qcow2", "raw"];

/// Verdict on whether a discovered object may be imported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "camelCase")]
pub enum Eligibility {
    Eligible,
    Ineligible(String),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Judge a descriptor without side effects
pub fn assess(descriptor: &PhysicalObjectDescriptor) -> Eligibility {
    if descriptor.locked {
        return Eligibility::Ineligible("object is locked by another process".to_string());
    }
    if descriptor.encrypted {
        return Eligibility::Ineligible("object is encrypted".to_string());
    }
    if let Some(backing) = &descriptor.backing_file {
        return Eligibility::Ineligible(format!("object has external backing file {}", backing));
    }
    let format = descriptor.format.to_lowercase();
    if !SUPPORTED_FORMATS.contains(&format.as_str()) {
        return Eligibility::Ineligible(format!("unsupported format {}", descriptor.format));
    }
    Eligibility::Eligible
}

/// Gate an import, failing with `IneligibleForReconciliation`
pub fn check(descriptor: &PhysicalObjectDescriptor) -> Result<()> {
    match assess(descriptor) {
        Eligibility::Eligible => Ok(()),
        Eligibility::Ineligible(reason) => Err(Error::IneligibleForReconciliation {
            path: descriptor.path.clone(),
            reason,
        }),
    }
}
