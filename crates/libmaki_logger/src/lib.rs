//! Append-only chat log files.
//!
//! One `Logger` serves one server. Log files live under
//! `<log dir>/<server>/<name>.txt` where `<name>` comes from the configured
//! file name template: `$n` is replaced with the log target (channel or
//! nick) and strftime-style `%` codes are evaluated at write time, so a
//! template like `$n/%Y-%m` rotates files monthly. Files are opened lazily
//! on first write and kept open for the life of the logger. Every line is
//! stamped `YYYY-MM-DD HH:MM:SS `.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::rc::Rc;

use time::macros::format_description;
use time::OffsetDateTime;

#[macro_use]
extern crate log;

#[derive(Clone)]
pub struct Logger {
    inner: Rc<RefCell<LoggerInner>>,
}

struct LoggerInner {
    enabled: bool,

    /// Root log directory (all servers).
    log_dir: PathBuf,

    /// Name of the server this logger belongs to.
    server: String,

    /// File name template (`$n` + strftime codes), without the `.txt`
    /// suffix.
    template: String,

    /// Open log files, keyed by the expanded template.
    files: HashMap<String, File>,
}

impl Logger {
    pub fn new(log_dir: PathBuf, server: &str, template: &str, enabled: bool) -> Logger {
        Logger {
            inner: Rc::new(RefCell::new(LoggerInner {
                enabled,
                log_dir,
                server: server.to_owned(),
                template: template.to_owned(),
                files: HashMap::new(),
            })),
        }
    }

    /// A logger that drops everything. Used in tests and when logging is
    /// turned off.
    pub fn disabled() -> Logger {
        Logger::new(PathBuf::new(), "", "$n", false)
    }

    /// Append a line to the log of `target` (a channel or a nick).
    pub fn write(&self, target: &str, line: &str) {
        self.inner.borrow_mut().write(target, line)
    }

    /// The last `count` lines of the current log file of `target`.
    pub fn tail(&self, target: &str, count: usize) -> Vec<String> {
        self.inner.borrow().tail(target, count)
    }
}

impl LoggerInner {
    fn write(&mut self, target: &str, line: &str) {
        if !self.enabled {
            return;
        }

        let name = expand_template(&self.template, target, now());
        let path = self.file_path(&name);
        let file = match self.files.entry(name) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if let Some(parent) = path.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => entry.insert(file),
                    Err(err) => {
                        warn!("couldn't open log file {:?}: {}", path, err);
                        return;
                    }
                }
            }
        };

        let stamp = now()
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .unwrap_or_default();
        if let Err(err) = writeln!(file, "{} {}", stamp, line) {
            warn!("couldn't write log line: {}", err);
        }
        let _ = file.flush();
    }

    fn tail(&self, target: &str, count: usize) -> Vec<String> {
        let name = expand_template(&self.template, target, now());
        let file = match File::open(self.file_path(&name)) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };

        let mut lines: Vec<String> = BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .collect();
        if lines.len() > count {
            lines.drain(0..lines.len() - count);
        }
        lines
    }

    fn file_path(&self, expanded: &str) -> PathBuf {
        self.log_dir
            .join(&self.server)
            .join(format!("{}.txt", expanded))
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

// '/' is valid in channel names but not in file names.
fn replace_forward_slash(target: &str) -> String {
    target.replace('/', "-")
}

/// Expand a file name template: `$n` becomes the target, `%`-codes are
/// evaluated against `at`. Unknown codes are kept as-is.
fn expand_template(template: &str, target: &str, at: OffsetDateTime) -> String {
    let template = template.replace("$n", &replace_forward_slash(target));

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('Y') => out.push_str(&format!("{:04}", at.year())),
            Some('y') => out.push_str(&format!("{:02}", at.year().rem_euclid(100))),
            Some('m') => out.push_str(&format!("{:02}", at.month() as u8)),
            Some('d') => out.push_str(&format!("{:02}", at.day())),
            Some('j') => out.push_str(&format!("{:03}", at.ordinal())),
            Some('H') => out.push_str(&format!("{:02}", at.hour())),
            Some('M') => out.push_str(&format!("{:02}", at.minute())),
            Some('S') => out.push_str(&format!("{:02}", at.second())),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}
