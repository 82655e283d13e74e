//! 终端输出格式化

use ftlink_core::{DirectoryEntry, EntryKind, ProgressFn};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// `ls --json` 的输出条目
#[derive(Serialize)]
struct JsonEntry<'a> {
    name: &'a str,
    directory: bool,
    file_size: u64,
    /// 修改时间 (Unix 秒)，旧固件没有
    modified: Option<u64>,
}

fn unix_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn print_entries(entries: &[DirectoryEntry]) {
    if entries.is_empty() {
        println!("   (空目录)");
        return;
    }
    for entry in entries {
        let modified = entry
            .modified
            .and_then(unix_secs)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        match entry.kind {
            EntryKind::Directory => {
                println!("   📁 {:<32} {:>10} {}", format!("{}/", entry.name), "", modified);
            }
            EntryKind::File { size } => {
                println!("   📄 {:<32} {:>10} {}", entry.name, human_size(size), modified);
            }
        }
    }
}

pub fn print_entries_json(entries: &[DirectoryEntry]) -> anyhow::Result<()> {
    let items: Vec<JsonEntry<'_>> = entries
        .iter()
        .map(|e| JsonEntry {
            name: &e.name,
            directory: e.is_directory(),
            file_size: e.size().unwrap_or(0),
            modified: e.modified.and_then(unix_secs),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&items)?);
    Ok(())
}

/// 在同一行刷新传输进度
pub fn progress_bar(label: &'static str) -> ProgressFn {
    Arc::new(move |done, total| {
        let percent = if total == 0 {
            100.0
        } else {
            done as f64 * 100.0 / total as f64
        };
        eprint!(
            "\r   {} {:>5.1}% ({}/{})",
            label,
            percent,
            human_size(done),
            human_size(total)
        );
        if done >= total {
            eprintln!();
        }
        let _ = std::io::stderr().flush();
    })
}
