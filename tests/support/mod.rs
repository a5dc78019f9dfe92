#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

pub const STACK_MANIFEST: &str = "Stack.yaml";
pub const HUT_MANIFEST: &str = "Hutfile.yaml";

/// A service directory with a base stack manifest, an `echo` hut manifest
/// and a content store, all inside one temp dir.
pub struct EchoProject {
    pub dir: TempDir,
}

impl EchoProject {
    pub fn new() -> Self {
        Self::with_script("#!/bin/sh\necho \"hello ${GREETING:-world}\"\necho \"to stderr\" >&2\n")
    }

    pub fn with_script(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let service = dir.path().join("service");
        fs::create_dir_all(service.join("src")).unwrap();
        fs::write(service.join("src/echo.sh"), script).unwrap();
        fs::write(
            service.join(STACK_MANIFEST),
            "serviceName: base\nstack: base@1\nbuild:\n  - exec: mkdir -p bin\nrun: sh\n",
        )
        .unwrap();
        fs::write(
            service.join(HUT_MANIFEST),
            "serviceName: echo\nstack: base@1\nbuild:\n  - copy: ./src bin\n  - exec: chmod +x bin/echo.sh\nrun: echo.sh\nresources:\n  cpu: 1\n  memory: 256\n",
        )
        .unwrap();
        Self { dir }
    }

    pub fn service_dir(&self) -> PathBuf {
        self.dir.path().join("service")
    }

    pub fn stack_manifest(&self) -> PathBuf {
        self.service_dir().join(STACK_MANIFEST)
    }

    pub fn hut_manifest(&self) -> PathBuf {
        self.service_dir().join(HUT_MANIFEST)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.dir.path().join("store")
    }

    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.service_dir().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }
}

pub fn tmp_is_empty(store: &Path) -> bool {
    fs::read_dir(store.join("tmp"))
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

/// Present in `/proc` and not a zombie.
#[cfg(target_os = "linux")]
pub fn process_is_running(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| {
            stat.rsplit_once(") ")
                .is_some_and(|(_, rest)| !rest.starts_with('Z'))
        })
        .unwrap_or(false)
}

/// Wait up to five seconds for `pid` to go away.
#[cfg(target_os = "linux")]
pub fn process_exits(pid: u32) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while process_is_running(pid) {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    true
}
