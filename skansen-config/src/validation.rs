//! Custom validation functions shared by the configuration sections and the
//! policy loader.

use lazy_static::lazy_static;
use regex::Regex;
use skansen_core::ProtoPort;
use validator::ValidationError;

lazy_static! {
    static ref INTERFACE_NAME: Option<Regex> = Regex::new("^[A-Za-z0-9_.-]{1,15}$").ok();
    static ref LOG_LEVEL: Option<Regex> =
        Regex::new("^(?i)(trace|debug|info|warn|error|off)$").ok();
}

/// Validate that an interface name follows Linux naming conventions.
pub fn validate_interface(name: &str) -> Result<(), ValidationError> {
    let re = INTERFACE_NAME
        .as_ref()
        .ok_or_else(|| ValidationError::new("invalid_regex"))?;
    if re.is_match(name) && name != "." && name != ".." {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_interface"))
    }
}

/// Failsafe ports must be real ports; port 0 never matches a packet.
pub fn validate_ports(ports: &[ProtoPort]) -> Result<(), ValidationError> {
    if ports.iter().any(|p| p.port == 0) {
        return Err(ValidationError::new("invalid_port"));
    }
    Ok(())
}

pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let re = LOG_LEVEL
        .as_ref()
        .ok_or_else(|| ValidationError::new("invalid_regex"))?;
    if re.is_match(level) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}
