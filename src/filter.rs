//! Software fallback for CAN acceptance filtering.
//!
//! A bus sends as many filter rules to the hardware as the transport can
//! take; whatever is left over lands here and is checked per frame by a
//! compiled [`SoftwareFilter`]. The filter is rebuilt once per rule-set
//! change, never per frame.

use serde::{Deserialize, Serialize};

use crate::error::CanError;
use crate::frame::{CanFrame, IdType};

/// One acceptance rule. A rule belongs to exactly one list (hardware or
/// software fallback), decided once at configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterRule {
    /// Accept when `(id & mask) == (code & mask)`.
    Mask { code: u32, mask: u32, id_type: IdType },
    /// Accept when `from <= id <= to`.
    Range { from: u32, to: u32, id_type: IdType },
}

impl FilterRule {
    /// Configuration-time validation; bad rules never reach the hot path.
    pub fn validate(&self) -> Result<(), CanError> {
        match *self {
            FilterRule::Mask { code, mask, id_type } => {
                let max = id_type.max_id();
                if code > max || mask > max {
                    return Err(CanError::Config(format!(
                        "mask rule code=0x{code:X} mask=0x{mask:X} exceeds {id_type:?} id range"
                    )));
                }
            }
            FilterRule::Range { from, to, id_type } => {
                if from > to {
                    return Err(CanError::Config(format!(
                        "range rule from=0x{from:X} is above to=0x{to:X}"
                    )));
                }
                if to > id_type.max_id() {
                    return Err(CanError::Config(format!(
                        "range rule to=0x{to:X} exceeds {id_type:?} id range"
                    )));
                }
            }
        }
        Ok(())
    }

    fn matches(&self, id: u32, id_type: IdType) -> bool {
        match *self {
            FilterRule::Mask { code, mask, id_type: rule_type } => {
                rule_type == id_type && (id & mask) == (code & mask)
            }
            FilterRule::Range { from, to, id_type: rule_type } => {
                rule_type == id_type && from <= id && id <= to
            }
        }
    }
}

/// Compiled fallback predicate over an ordered rule list.
#[derive(Debug, Clone, Default)]
pub struct SoftwareFilter {
    rules: Vec<FilterRule>,
}

impl SoftwareFilter {
    /// Accept-everything filter (no fallback rules configured).
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Validate and compile a rule list.
    pub fn compile(rules: Vec<FilterRule>) -> Result<Self, CanError> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True when the frame passes the fallback filter. An empty rule list
    /// accepts everything.
    pub fn accepts(&self, frame: &CanFrame) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let id = frame.id();
        let id_type = frame.id_type();
        self.rules.iter().any(|rule| rule.matches(id, id_type))
    }
}
