//! Picking one target when a name matches several processes.

use anyhow::{bail, Context, Result};
use jinject_injector::ProcessInfo;
use std::io::{BufRead, Write};

/// Resolve `candidates` to one pid. A single match is taken as is; several
/// matches are listed on `out` and a 1-based choice is read from `input`.
pub fn choose<R: BufRead, W: Write>(
    name: &str,
    candidates: &[ProcessInfo],
    mut input: R,
    mut out: W,
) -> Result<u32> {
    match candidates {
        [] => bail!("no running process named {name}"),
        [only] => return Ok(only.pid),
        _ => {}
    }

    writeln!(out, "Several processes are named {name}:")?;
    for (i, info) in candidates.iter().enumerate() {
        writeln!(out, "  [{}] pid {}{}", i + 1, info.pid, elevation_note(info))?;
    }
    write!(out, "Select a process [1-{}]: ", candidates.len())?;
    out.flush()?;

    let mut line = String::new();
    input.read_line(&mut line).context("read selection")?;
    let choice: usize = line
        .trim()
        .parse()
        .with_context(|| format!("invalid selection {:?}", line.trim()))?;
    match choice.checked_sub(1).and_then(|i| candidates.get(i)) {
        Some(info) => Ok(info.pid),
        None => bail!("selection {choice} is out of range"),
    }
}

fn elevation_note(info: &ProcessInfo) -> &'static str {
    match info.elevated {
        Some(true) => " (elevated)",
        Some(false) => "",
        None => " (access limited)",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pid: u32, elevated: Option<bool>) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: Some("javaw.exe".to_string()),
            running: true,
            elevated,
        }
    }

    #[test]
    fn test_single_match_needs_no_input() {
        let mut out = Vec::new();
        let pid = choose("javaw.exe", &[info(42, None)], &b""[..], &mut out).unwrap();
        assert_eq!(pid, 42);
        assert!(out.is_empty());
    }

    #[test]
    fn test_no_match() {
        let err = choose("javaw.exe", &[], &b""[..], Vec::new()).unwrap_err();
        assert!(err.to_string().contains("no running process"));
    }

    #[test]
    fn test_prompt_and_pick() {
        let candidates = [info(10, Some(false)), info(20, Some(true))];
        let mut out = Vec::new();
        let pid = choose("javaw.exe", &candidates, &b"2\n"[..], &mut out).unwrap();
        assert_eq!(pid, 20);

        let shown = String::from_utf8(out).unwrap();
        assert!(shown.contains("[1] pid 10"));
        assert!(shown.contains("[2] pid 20 (elevated)"));
    }

    #[test]
    fn test_bad_selection() {
        let candidates = [info(10, None), info(20, None)];
        assert!(choose("javaw.exe", &candidates, &b"3\n"[..], Vec::new()).is_err());
        assert!(choose("javaw.exe", &candidates, &b"0\n"[..], Vec::new()).is_err());
        assert!(choose("javaw.exe", &candidates, &b"two\n"[..], Vec::new()).is_err());
    }
}
