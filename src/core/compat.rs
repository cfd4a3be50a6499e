//! Compatibility rule evaluation between two linked records.

use crate::core::controller::Model;
use crate::core::error::TauError;
use crate::core::schema::Requisite;
use tracing::warn;

/// Check every compat rule `lhs` declares that concerns `rhs`'s entity type.
///
/// Unmet `Required` rules and matched `Violation` rules fail with
/// [`TauError::IncompatibleRecordError`]. Unmet `Recommended` and `Encouraged`
/// rules only log a warning. Unset attributes on either side are evaluated
/// with their schema defaults.
pub fn check_compatibility(lhs: &Model, rhs: &Model) -> Result<(), TauError> {
    for attr in lhs.schema().attributes.iter().filter(|a| !a.compat.is_empty()) {
        let own = lhs.get_or_default(attr.name);
        for rule in &attr.compat {
            if !rule.when.eval(own.as_ref()) {
                continue;
            }
            let cond = rule.requisite.condition();
            if cond.model != rhs.kind() {
                continue;
            }
            let theirs = rhs.get_or_default(cond.attribute);
            let satisfied = cond.test.eval(theirs.as_ref());
            let lhs_desc = format!(
                "{} '{}' has {}",
                lhs.kind(),
                lhs.name(),
                rule.when.describe(attr.name)
            );
            let rhs_desc = format!(
                "{} '{}' {}",
                rhs.kind(),
                rhs.name(),
                cond.test.describe(cond.attribute)
            );
            match &rule.requisite {
                Requisite::Required(_) if !satisfied => {
                    return Err(TauError::IncompatibleRecordError(format!(
                        "{}, which requires {}",
                        lhs_desc, rhs_desc
                    )));
                }
                Requisite::Violation(_) if satisfied => {
                    return Err(TauError::IncompatibleRecordError(format!(
                        "{}, which is incompatible with {}",
                        lhs_desc, rhs_desc
                    )));
                }
                Requisite::Recommended(_) if !satisfied => {
                    warn!("{}, so {} is recommended", lhs_desc, rhs_desc);
                }
                Requisite::Encouraged(_) if !satisfied => {
                    warn!("{}, so {} is encouraged", lhs_desc, rhs_desc);
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Check both directions of a pair.
pub fn check_pair(a: &Model, b: &Model) -> Result<(), TauError> {
    check_compatibility(a, b)?;
    check_compatibility(b, a)
}
