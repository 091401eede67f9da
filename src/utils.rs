use crate::error::{Result, SpeedTestError};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use reqwest::Url;
use std::sync::OnceLock;
use std::time::Duration;

static SCHEME_RE: OnceLock<Regex> = OnceLock::new();

fn scheme_re() -> &'static Regex {
    SCHEME_RE.get_or_init(|| Regex::new(r"(?i)^https?://").expect("scheme pattern is a literal"))
}

/// 规范化服务器地址
///
/// - `//host/path` (LibreSpeed 列表中常见) 和裸主机名都补上 `https://`
/// - 结尾的斜杠统一为一个
///
/// Idempotent: `normalized_url(normalized_url(x)) == normalized_url(x)`.
pub fn normalized_url(raw: &str) -> String {
    let raw = raw.trim();
    let (scheme, rest) = match scheme_re().find(raw) {
        Some(m) => raw.split_at(m.end()),
        None => ("https://", raw.trim_start_matches('/')),
    };

    // 只处理 scheme:// 之后的部分, 分隔符本身不能被当作结尾斜杠
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return scheme.to_string();
    }
    format!("{}{}/", scheme, rest)
}

/// Join a server base with one of its relative endpoint paths.
pub fn endpoint_url(base: &str, path: &str) -> String {
    format!("{}{}", normalized_url(base), path.trim_start_matches('/'))
}

/// `host:port` to dial for a normalized URL; the port falls back to the scheme default.
pub fn dial_target(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| SpeedTestError::InvalidHost(format!("{}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| SpeedTestError::InvalidHost(url.to_string()))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| SpeedTestError::InvalidHost(url.to_string()))?;
    Ok(format!("{}:{}", host, port))
}

/// Mbps = bits / (seconds * 10^6). A zero elapsed time reports 0 instead of infinity.
pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (secs * 1_000_000.0)
}

/// A step spinner: prints "`<message>` done." when finished.
pub struct Spinner {
    pb: ProgressBar,
    message: String,
    quiet: bool,
}

impl Spinner {
    pub fn start(message: &str, quiet: bool) -> Self {
        let pb = if quiet {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        };
        pb.set_message(message.to_string());

        Self {
            pb,
            message: message.to_string(),
            quiet,
        }
    }

    /// A spinner that never draws or prints (API mode, JSON output, tests).
    pub fn quiet() -> Self {
        Self::start("", true)
    }

    #[cfg(test)]
    fn with_bar(pb: ProgressBar, quiet: bool) -> Self {
        Self {
            pb,
            message: String::new(),
            quiet,
        }
    }

    fn line_target(&self) -> LineTarget {
        if self.quiet {
            LineTarget::Skip
        } else if self.pb.is_hidden() {
            // stderr 不是终端时进度条不会绘制, println 也会被丢弃
            LineTarget::Stdout
        } else {
            LineTarget::Bar
        }
    }

    /// Print a line above the spinner, or straight to stdout when the bar can't draw.
    pub fn println(&self, line: impl AsRef<str>) {
        match self.line_target() {
            LineTarget::Skip => {}
            LineTarget::Stdout => println!("{}", line.as_ref()),
            LineTarget::Bar => self.pb.println(line),
        }
    }

    pub fn finish(self) {
        self.pb.finish_and_clear();
        if !self.quiet {
            println!("{} done.", self.message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineTarget {
    Skip,
    Stdout,
    Bar,
}

/// 探测进度条 (与服务器数量对应)
pub fn probe_progress(len: usize, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template("[{bar:40.cyan/blue}] {percent}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("|| "),
    );
    pb.set_message("Probing...");
    pb
}
