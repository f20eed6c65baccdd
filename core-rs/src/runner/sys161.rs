//! Simulator work-directory preparation: kernel root copy, `sys161.conf`
//! and disk images.

use crate::errors::{Result, Test161Error};
use crate::test::{DiskConf, Sys161Conf};
use std::fs;
use std::path::Path;
use std::process::Command as ProcessCommand;
use tracing::debug;
use walkdir::WalkDir;

pub const CONF_FILE: &str = "sys161.conf";
const DISK_FILES: [&str; 2] = ["LHD0.img", "LHD1.img"];

fn disk_line(slot: u32, file: &str, disk: &DiskConf) -> String {
    if !disk.enabled {
        return String::new();
    }
    let mut line = format!("{} disk rpm={} file={}", slot, disk.rpm, file);
    if disk.nodoom {
        line.push_str(" nodoom");
    }
    line
}

/// Render the simulator configuration. Disabled disks leave no line.
pub fn conf_string(conf: &Sys161Conf, seed: u16) -> String {
    let lines = [
        "0 serial".to_string(),
        "1 emufs".to_string(),
        disk_line(2, DISK_FILES[0], &conf.disk1),
        disk_line(3, DISK_FILES[1], &conf.disk2),
        format!("28 random seed={}", seed),
        "29 timer".to_string(),
        "30 trace".to_string(),
        format!("31 mainboard ramsize={} cpus={}", conf.ram, conf.cpus),
    ];
    let mut out = lines
        .iter()
        .filter(|l| !l.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    out.push('\n');
    out
}

/// Recursively copy `src` into `dst`, creating directories as needed.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Test161Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", src.display()),
        )));
    }
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| Test161Error::Io(e.into()))?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Create the configured disk images with the external disk tool.
pub fn create_disks(dir: &Path, conf: &Sys161Conf, disk_tool: &str) -> Result<()> {
    for (disk, file) in [&conf.disk1, &conf.disk2].into_iter().zip(DISK_FILES) {
        if !disk.enabled {
            continue;
        }
        let path = dir.join(file);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        debug!(file, size = %disk.bytes, "creating disk image");
        let out = ProcessCommand::new(disk_tool)
            .args(["create", file, disk.bytes.as_str()])
            .current_dir(dir)
            .output()
            .map_err(|e| Test161Error::SimulatorSpawnFailed(format!("{}: {}", disk_tool, e)))?;
        if !out.status.success() {
            return Err(Test161Error::SimulatorSpawnFailed(format!(
                "{} create {} {}: {}",
                disk_tool,
                file,
                disk.bytes,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
    }
    Ok(())
}
