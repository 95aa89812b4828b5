//! Line-oriented ASCII wire protocol: parses one command per line, calls
//! into the [`SetManager`], and renders the reply strings from the command
//! table. No framing beyond newline-delimited lines; `\r\n` and `\n` line
//! endings are both accepted.

use crate::error::ManagerError;
use crate::manager::{CreateOptions, SetManager};
use crate::sketch::StorageMode;

const ERR_UNSUPPORTED: &str = "Client Error: Command not supported\n";
const ERR_BAD_ARGS: &str = "Client Error: Bad arguments\n";
const ERR_NEED_NAME: &str = "Client Error: Must provide set name\n";
const ERR_NEED_NAME_AND_KEY: &str = "Client Error: Must provide set name and key\n";

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 200
}

fn format_f64(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn reply_for_error(err: &ManagerError) -> String {
    match err {
        ManagerError::NotFound => "Set does not exist\n".to_string(),
        ManagerError::Exists => "Exists\n".to_string(),
        ManagerError::DeletePending => "Delete in progress\n".to_string(),
        ManagerError::NotProxied => "Set is not proxied. Close it first.\n".to_string(),
        ManagerError::BadArguments => ERR_BAD_ARGS.to_string(),
        ManagerError::Internal(_) | ManagerError::Io(_) => format!("{err}\n"),
    }
}

/// Parses and executes one protocol line (without its trailing newline
/// required — any trailing `\r`/`\n` is stripped), returning the full reply
/// text including its own trailing newline(s).
pub fn handle_line(manager: &SetManager, line: &str) -> String {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split_ascii_whitespace();
    let Some(cmd) = parts.next() else {
        return ERR_BAD_ARGS.to_string();
    };
    match cmd {
        "create" => handle_create(manager, parts),
        "list" => handle_list(manager, parts),
        "drop" => handle_simple(parts, |name| manager.drop_set(name)),
        "close" => handle_simple(parts, |name| manager.unmap(name)),
        "clear" => handle_simple(parts, |name| manager.clear(name)),
        "set" | "s" => handle_set(manager, parts),
        "bulk" | "b" => handle_bulk(manager, parts),
        "info" => handle_info(manager, parts),
        "flush" => handle_flush(manager, parts),
        _ => ERR_UNSUPPORTED.to_string(),
    }
}

fn handle_create<'a>(manager: &SetManager, mut parts: impl Iterator<Item = &'a str>) -> String {
    let Some(name) = parts.next() else {
        return ERR_NEED_NAME.to_string();
    };
    if !valid_name(name) {
        return ERR_BAD_ARGS.to_string();
    }

    let mut opts = CreateOptions::default();
    for kv in parts {
        let Some((key, value)) = kv.split_once('=') else {
            return ERR_BAD_ARGS.to_string();
        };
        match key {
            "precision" => match value.parse::<u8>() {
                Ok(p) => opts.precision = Some(p),
                Err(_) => return ERR_BAD_ARGS.to_string(),
            },
            "eps" => match value.parse::<f64>() {
                Ok(e) => opts.eps = Some(e),
                Err(_) => return ERR_BAD_ARGS.to_string(),
            },
            "in_memory" => match value {
                "0" => opts.in_memory = Some(false),
                "1" => opts.in_memory = Some(true),
                _ => return ERR_BAD_ARGS.to_string(),
            },
            _ => return ERR_BAD_ARGS.to_string(),
        }
    }

    match manager.create(name.as_bytes(), opts) {
        Ok(()) => "Done\n".to_string(),
        Err(err) => reply_for_error(&err),
    }
}

fn handle_simple<'a>(
    mut parts: impl Iterator<Item = &'a str>,
    op: impl FnOnce(&[u8]) -> Result<(), ManagerError>,
) -> String {
    let Some(name) = parts.next() else {
        return ERR_NEED_NAME.to_string();
    };
    if !valid_name(name) {
        return ERR_BAD_ARGS.to_string();
    }
    match op(name.as_bytes()) {
        Ok(()) => "Done\n".to_string(),
        Err(err) => reply_for_error(&err),
    }
}

fn handle_set<'a>(manager: &SetManager, mut parts: impl Iterator<Item = &'a str>) -> String {
    let (Some(name), Some(key)) = (parts.next(), parts.next()) else {
        return ERR_NEED_NAME_AND_KEY.to_string();
    };
    if !valid_name(name) {
        return ERR_BAD_ARGS.to_string();
    }
    match manager.add_keys(name.as_bytes(), &[key.as_bytes()]) {
        Ok(()) => "Done\n".to_string(),
        Err(err) => reply_for_error(&err),
    }
}

fn handle_bulk<'a>(manager: &SetManager, mut parts: impl Iterator<Item = &'a str>) -> String {
    let Some(name) = parts.next() else {
        return ERR_NEED_NAME_AND_KEY.to_string();
    };
    if !valid_name(name) {
        return ERR_BAD_ARGS.to_string();
    }
    let keys: Vec<&str> = parts.collect();
    if keys.is_empty() {
        return ERR_NEED_NAME_AND_KEY.to_string();
    }
    let key_bytes: Vec<&[u8]> = keys.iter().map(|k| k.as_bytes()).collect();
    match manager.add_keys(name.as_bytes(), &key_bytes) {
        Ok(()) => "Done\n".to_string(),
        Err(err) => reply_for_error(&err),
    }
}

fn handle_list<'a>(manager: &SetManager, mut parts: impl Iterator<Item = &'a str>) -> String {
    let prefix = parts.next().unwrap_or("");
    let mut out = String::from("START\n");
    for listing in manager.list(prefix.as_bytes()) {
        out.push_str(&format!(
            "{} {} {} {} {}\n",
            String::from_utf8_lossy(&listing.name),
            format_f64(listing.eps),
            listing.precision,
            listing.byte_size,
            format_f64(listing.size_estimate),
        ));
    }
    out.push_str("END\n");
    out
}

fn handle_info<'a>(manager: &SetManager, mut parts: impl Iterator<Item = &'a str>) -> String {
    let Some(name) = parts.next() else {
        return ERR_NEED_NAME.to_string();
    };
    if !valid_name(name) {
        return ERR_BAD_ARGS.to_string();
    }
    let result = manager.cb(name.as_bytes(), |sketch| {
        let counters = sketch.counters();
        format!(
            "START\nin_memory {}\npage_ins {}\npage_outs {}\neps {}\nprecision {}\nsets {}\nsize {}\nstorage {}\nEND\n",
            i32::from(sketch.mode() == StorageMode::InMemory),
            counters.page_ins,
            counters.page_outs,
            format_f64(sketch.eps()),
            sketch.precision(),
            counters.adds,
            format_f64(sketch.size()),
            sketch.mode().as_str(),
        )
    });
    match result {
        Ok(body) => body,
        Err(err) => reply_for_error(&err),
    }
}

fn handle_flush<'a>(manager: &SetManager, mut parts: impl Iterator<Item = &'a str>) -> String {
    match parts.next() {
        Some(name) => {
            if !valid_name(name) {
                return ERR_BAD_ARGS.to_string();
            }
            match manager.flush(name.as_bytes()) {
                Ok(()) => "Done\n".to_string(),
                Err(err) => reply_for_error(&err),
            }
        }
        None => {
            for listing in manager.list(b"") {
                let _ = manager.flush(&listing.name);
            }
            "Done\n".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> SetManager {
        let mut cfg = GlobalConfig::default();
        cfg.data_dir = dir.to_string_lossy().to_string();
        SetManager::new(cfg)
    }

    #[test]
    fn scenario_one_create_list_drop() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        assert_eq!(handle_line(&mgr, "create foo eps=0.01\n"), "Done\n");
        assert_eq!(handle_line(&mgr, "list\n"), "START\nfoo 0.008125 14 12288 0\nEND\n");
        assert_eq!(handle_line(&mgr, "drop foo\n"), "Done\n");
        assert_eq!(handle_line(&mgr, "list\n"), "START\nEND\n");
    }

    #[test]
    fn scenario_two_set_bulk_info() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());

        assert_eq!(handle_line(&mgr, "create a\n"), "Done\n");
        assert_eq!(handle_line(&mgr, "set a x\n"), "Done\n");
        assert_eq!(handle_line(&mgr, "set a y\n"), "Done\n");
        assert_eq!(handle_line(&mgr, "bulk a x z\n"), "Done\n");

        let info = handle_line(&mgr, "info a\n");
        assert!(info.contains("sets 3\n"), "info={info}");

        assert_eq!(handle_line(&mgr, "drop a\n"), "Done\n");
    }

    #[test]
    fn scenario_three_create_drop_create_is_pending() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        assert_eq!(handle_line(&mgr, "create a\n"), "Done\n");
        assert_eq!(handle_line(&mgr, "drop a\n"), "Done\n");
        assert_eq!(handle_line(&mgr, "create a\n"), "Delete in progress\n");
    }

    #[test]
    fn unknown_command_is_rejected() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        assert_eq!(handle_line(&mgr, "frobnicate a\n"), ERR_UNSUPPORTED);
    }

    #[test]
    fn set_on_missing_set_reports_not_found() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        assert_eq!(handle_line(&mgr, "set ghost k\n"), "Set does not exist\n");
    }

    #[test]
    fn set_without_key_is_bad_arguments() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        assert_eq!(handle_line(&mgr, "set a\n"), ERR_NEED_NAME_AND_KEY);
    }

    #[test]
    fn clear_on_resident_set_is_rejected() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        handle_line(&mgr, "create a\n");
        handle_line(&mgr, "set a k\n");
        assert_eq!(handle_line(&mgr, "clear a\n"), "Set is not proxied. Close it first.\n");
    }
}
