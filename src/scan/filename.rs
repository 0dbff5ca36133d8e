//! File name templates and overwrite confirmation.
//!
//! The areaDetector file plugin builds its file name from a C `printf`
//! template such as `%s%s_%3.3d.h5` applied to (path, name, number). The same
//! expansion is needed here to know which file a scan is about to write.
//! Only the conversions file templates use are supported: `%s`, `%d`, `%i`,
//! `%u` and `%%`, with flags, width and precision.

use async_trait::async_trait;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};

use crate::config::OverwritePolicy;
use crate::error::{ScanError, ScanResult};

/// Argument of a file name template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateArg {
    /// Consumed by `%s`
    Str(String),
    /// Consumed by `%d`, `%i` and `%u`
    Int(i64),
}

impl From<&str> for TemplateArg {
    fn from(value: &str) -> Self {
        TemplateArg::Str(value.to_string())
    }
}

impl From<i64> for TemplateArg {
    fn from(value: i64) -> Self {
        TemplateArg::Int(value)
    }
}

#[derive(Default)]
struct Spec {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl Spec {
    fn pad(&self, body: String, numeric: bool) -> String {
        let len = body.chars().count();
        if len >= self.width {
            return body;
        }
        let fill = self.width - len;
        if self.left {
            format!("{body}{}", " ".repeat(fill))
        } else if self.zero && numeric && self.precision.is_none() {
            // zeros go after the sign
            let (sign, digits) = match body.chars().next() {
                Some(c @ ('-' | '+' | ' ')) => (c.to_string(), body[1..].to_string()),
                _ => (String::new(), body),
            };
            format!("{sign}{}{digits}", "0".repeat(fill))
        } else {
            format!("{}{body}", " ".repeat(fill))
        }
    }

    fn integer(&self, value: i64) -> String {
        let mut digits = value.unsigned_abs().to_string();
        if let Some(precision) = self.precision {
            if precision == 0 && value == 0 {
                digits.clear();
            } else if digits.len() < precision {
                digits = format!("{}{digits}", "0".repeat(precision - digits.len()));
            }
        }
        let sign = if value < 0 {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        };
        self.pad(format!("{sign}{digits}"), true)
    }

    fn string(&self, value: &str) -> String {
        let body = match self.precision {
            Some(precision) => value.chars().take(precision).collect(),
            None => value.to_string(),
        };
        self.pad(body, false)
    }
}

fn digits(chars: &[char], pos: &mut usize) -> Option<usize> {
    let start = *pos;
    while *pos < chars.len() && chars[*pos].is_ascii_digit() {
        *pos += 1;
    }
    if *pos == start {
        return None;
    }
    chars[start..*pos].iter().collect::<String>().parse().ok()
}

/// Expand a C-style template.
///
/// Returns `None` when the template does not consume exactly `args`, or when
/// a conversion does not match its argument's type.
pub fn format_file_name(template: &str, args: &[TemplateArg]) -> Option<String> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len() + 32);
    let mut args = args.iter();
    let mut pos = 0;
    while pos < chars.len() {
        let c = chars[pos];
        pos += 1;
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = Spec::default();
        while let Some(flag) = chars.get(pos) {
            match flag {
                '-' => spec.left = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '0' => spec.zero = true,
                '#' => {}
                _ => break,
            }
            pos += 1;
        }
        spec.width = digits(&chars, &mut pos).unwrap_or(0);
        if chars.get(pos) == Some(&'.') {
            pos += 1;
            spec.precision = Some(digits(&chars, &mut pos).unwrap_or(0));
        }
        // length modifiers carry no meaning here
        while matches!(chars.get(pos), Some('l' | 'h')) {
            pos += 1;
        }
        let conversion = *chars.get(pos)?;
        pos += 1;
        match conversion {
            '%' => out.push('%'),
            's' => match args.next()? {
                TemplateArg::Str(s) => out.push_str(&spec.string(s)),
                TemplateArg::Int(_) => return None,
            },
            'd' | 'i' | 'u' => match args.next()? {
                TemplateArg::Int(v) => out.push_str(&spec.integer(*v)),
                TemplateArg::Str(_) => return None,
            },
            _ => return None,
        }
    }
    if args.next().is_some() {
        return None;
    }
    Some(out)
}

/// Name of the file the plugin will write for (path, name, number).
///
/// Templates that take fewer arguments are tried in turn: (path, name) and
/// then (path) alone.
///
/// # Errors
///
/// `ScanError::Configuration` when no argument list fits the template.
pub fn target_file_name(template: &str, path: &str, name: &str, number: i64) -> ScanResult<String> {
    let candidates: [Vec<TemplateArg>; 3] = [
        vec![path.into(), name.into(), number.into()],
        vec![path.into(), name.into()],
        vec![path.into()],
    ];
    candidates
        .iter()
        .find_map(|args| format_file_name(template, args))
        .ok_or_else(|| {
            error!(%template, "file name template not supported");
            ScanError::Configuration(format!("file name template '{template}' not supported"))
        })
}

/// Asks whether an existing data file may be overwritten.
#[async_trait]
pub trait OverwriteConfirm: Send + Sync {
    /// `true` to overwrite `path`, `false` to refuse the scan.
    async fn confirm(&self, path: &Path) -> bool;
}

/// Always overwrites.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOverwrite;

#[async_trait]
impl OverwriteConfirm for AlwaysOverwrite {
    async fn confirm(&self, path: &Path) -> bool {
        warn!(path = %path.display(), "overwriting existing file");
        true
    }
}

/// Never overwrites.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverOverwrite;

#[async_trait]
impl OverwriteConfirm for NeverOverwrite {
    async fn confirm(&self, path: &Path) -> bool {
        warn!(path = %path.display(), "refusing to overwrite existing file");
        false
    }
}

/// Asks on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl OverwriteConfirm for TerminalPrompt {
    async fn confirm(&self, path: &Path) -> bool {
        let path: PathBuf = path.to_path_buf();
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "File {} exists.  Overwrite? [y/N] ", path.display());
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }
}

/// Confirmation strategy for a configured policy.
pub fn confirm_for(policy: OverwritePolicy) -> Arc<dyn OverwriteConfirm> {
    match policy {
        OverwritePolicy::Prompt => Arc::new(TerminalPrompt),
        OverwritePolicy::Overwrite => Arc::new(AlwaysOverwrite),
        OverwritePolicy::Refuse => Arc::new(NeverOverwrite),
    }
}
