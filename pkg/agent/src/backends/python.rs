// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! ptvsd backend: the target must already call `ptvsd.enable_attach`. The
//! listen port comes from a `SQUASH_PTVSD_PORT` variable in the target's
//! environment, or failing that from a bounded scan of the target's working
//! tree for the enable_attach call site.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use log::debug;
use regex::Regex;
use walkdir::WalkDir;

use super::{BackendError, DebugServer};
use crate::locator::ContainerTarget;
use crate::procfs::ProcFs;

pub const PORT_ENV: &str = "SQUASH_PTVSD_PORT";

// Scan bounds; a container working tree can be arbitrarily large.
const MAX_DEPTH: usize = 6;
const MAX_FILES: usize = 2048;

// The port is the last argument of the address tuple:
// ptvsd.enable_attach("secret", address=('0.0.0.0', 3000)).
static ENABLE_ATTACH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ptvsd\.enable_attach\s*\(.*?(\d+)\s*\)").expect("enable_attach pattern")
});

pub(super) fn attach(
    target: &ContainerTarget,
    procfs: &ProcFs,
) -> Result<DebugServer, BackendError> {
    let override_port = target
        .env
        .get(PORT_ENV)
        .cloned()
        .or_else(|| std::env::var(PORT_ENV).ok())
        .and_then(|raw| raw.parse().ok());
    if let Some(port) = override_port {
        return Ok(DebugServer::in_target(port));
    }

    let cwd = procfs.cwd(target.pid);
    let port = port_from_source(&cwd).ok_or_else(|| BackendError::PtvsdNotFound {
        dir: cwd.clone(),
    })?;
    Ok(DebugServer::in_target(port))
}

/// Finds the first parsable `ptvsd.enable_attach` port in `.py` files under
/// `root`, depth- and file-count-bounded.
pub fn port_from_source(root: &Path) -> Option<u16> {
    let mut seen = 0usize;
    for entry in WalkDir::new(root)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        if seen >= MAX_FILES {
            debug!("stopping ptvsd scan after {MAX_FILES} files");
            return None;
        }
        seen += 1;
        if entry.path().extension().and_then(|ext| ext.to_str()) != Some("py") {
            continue;
        }
        let Ok(source) = fs::read_to_string(entry.path()) else {
            continue;
        };
        if let Some(port) = parse_enable_attach(&source) {
            debug!("found enable_attach port {port} in {}", entry.path().display());
            return Some(port);
        }
    }
    None
}

fn parse_enable_attach(source: &str) -> Option<u16> {
    let captures = ENABLE_ATTACH.captures(source)?;
    captures.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_tuple() {
        let source = "import ptvsd\nptvsd.enable_attach(\"secret\", address=('0.0.0.0', 3000))\n";
        assert_eq!(parse_enable_attach(source), Some(3000));
    }

    #[test]
    fn test_parse_bare_port() {
        assert_eq!(parse_enable_attach("ptvsd.enable_attach(5678)"), Some(5678));
    }

    #[test]
    fn test_parse_no_call() {
        assert_eq!(parse_enable_attach("print('hello')\n"), None);
    }

    #[test]
    fn test_scan_finds_nested_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app/web")).unwrap();
        fs::write(dir.path().join("app/README.md"), "docs").unwrap();
        fs::write(
            dir.path().join("app/web/main.py"),
            "import ptvsd\nptvsd.enable_attach(address=('0.0.0.0', 5678))\n",
        )
        .unwrap();

        assert_eq!(port_from_source(dir.path()), Some(5678));
    }

    #[test]
    fn test_scan_ignores_non_python_mentions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("notes.txt"),
            "ptvsd.enable_attach(address=('0.0.0.0', 3000))",
        )
        .unwrap();

        assert_eq!(port_from_source(dir.path()), None);
    }
}
