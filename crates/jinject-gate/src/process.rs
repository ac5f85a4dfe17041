//! Process name and target process checks.

use crate::tables::{is_critical_name, MAX_PROCESS_NAME_LEN, METACHARACTERS, RESERVED_PID_MAX};
use crate::{GateViolation, ProcessQuery};

/// Validate a process image name used for discovery.
pub fn validate_process_name(name: &str) -> Result<(), GateViolation> {
    let what = "process name";
    if name.is_empty() {
        return Err(GateViolation::Empty { what });
    }
    if name.chars().count() > MAX_PROCESS_NAME_LEN {
        return Err(GateViolation::TooLong {
            what,
            max: MAX_PROCESS_NAME_LEN,
        });
    }
    if name.contains(['/', '\\']) {
        return Err(GateViolation::Malformed {
            what,
            reason: "process names must not contain path separators",
        });
    }
    if let Some(ch) = name
        .chars()
        .find(|c| *c == '$' || c.is_control() || METACHARACTERS.contains(c))
    {
        return Err(GateViolation::ForbiddenChar { what, ch });
    }
    if is_critical_name(name) {
        jinject_config::log_gate_warn!("Refusing critical process name", name = name);
        return Err(GateViolation::CriticalName(name.to_string()));
    }
    Ok(())
}

/// Check that `pid` may be targeted.
///
/// Reserved low ids and deny-listed image names are refused. A pid whose
/// image name cannot be queried is refused as well.
pub fn check_target_process(query: &dyn ProcessQuery, pid: u32) -> Result<(), GateViolation> {
    if pid <= RESERVED_PID_MAX {
        return Err(GateViolation::ProtectedProcess {
            pid,
            reason: "reserved system process id".to_string(),
        });
    }

    let name = query.image_name(pid).map_err(|e| {
        jinject_config::log_gate_warn!(
            "Cannot inspect target process, treating as critical",
            pid = pid,
            error = e.to_string()
        );
        GateViolation::ProtectedProcess {
            pid,
            reason: format!("cannot be inspected: {e}"),
        }
    })?;

    if is_critical_name(&name) {
        return Err(GateViolation::ProtectedProcess {
            pid,
            reason: format!("{name} is a critical system process"),
        });
    }
    Ok(())
}

/// `true` when [`check_target_process`] refuses `pid`.
pub fn is_critical_process(query: &dyn ProcessQuery, pid: u32) -> bool {
    check_target_process(query, pid).is_err()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    struct Table(HashMap<u32, &'static str>);

    impl ProcessQuery for Table {
        fn image_name(&self, pid: u32) -> io::Result<String> {
            self.0
                .get(&pid)
                .map(|n| n.to_string())
                .ok_or_else(|| io::Error::from(io::ErrorKind::PermissionDenied))
        }

        fn is_elevated(&self) -> io::Result<bool> {
            Ok(true)
        }
    }

    fn table() -> Table {
        Table(HashMap::from([
            (612, "lsass.exe"),
            (4100, "javaw.exe"),
            (4200, "Explorer.EXE"),
        ]))
    }

    #[test]
    fn test_valid_process_names() {
        assert!(validate_process_name("javaw.exe").is_ok());
        assert!(validate_process_name("java").is_ok());
    }

    #[test]
    fn test_invalid_process_names() {
        assert!(validate_process_name("").is_err());
        assert!(validate_process_name(&"a".repeat(261)).is_err());
        assert!(validate_process_name(r"C:\jdk\bin\java.exe").is_err());
        assert!(validate_process_name("/usr/bin/java").is_err());
        assert!(validate_process_name("java;calc").is_err());
        assert!(validate_process_name("java$").is_err());
    }

    #[test]
    fn test_critical_process_names_rejected() {
        assert_eq!(
            validate_process_name("LSASS.exe"),
            Err(GateViolation::CriticalName("LSASS.exe".to_string()))
        );
        assert!(validate_process_name("csrss.exe").is_err());
    }

    #[test]
    fn test_reserved_pids_are_critical() {
        let q = table();
        for pid in 0..=RESERVED_PID_MAX {
            assert!(is_critical_process(&q, pid));
        }
    }

    #[test]
    fn test_deny_listed_image_is_critical() {
        let q = table();
        assert!(is_critical_process(&q, 612));
        assert!(is_critical_process(&q, 4200));
        assert!(!is_critical_process(&q, 4100));
    }

    #[test]
    fn test_uninspectable_pid_fails_closed() {
        let q = table();
        let err = check_target_process(&q, 9999).unwrap_err();
        assert_eq!(err.code(), jinject_ipc::ErrorCode::AccessDenied);
    }
}
