//! Terminal output with colored `[module]` prefixes.
//!
//! ```ignore
//! log!("runtime"; "started {} on port {}", id, port);
//! debug!("watch"; "raw notify: {:?}", event.kind);
//! ```
//!
//! `error` and `warning` lines go to stderr, everything else to stdout.

use crossterm::{
    execute,
    terminal::{Clear, ClearType},
};
use owo_colors::{OwoColorize, Style};
use std::{
    io::{Write, stderr, stdout},
    sync::atomic::{AtomicBool, Ordering},
};

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(v: bool) {
    VERBOSE.store(v, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

#[macro_export]
macro_rules! log {
    ($module:expr; $($arg:tt)*) => {{
        $crate::logger::log($module, &format!($($arg)*))
    }};
}

/// Like `log!`, printed only under `--verbose`.
#[macro_export]
macro_rules! debug {
    ($module:expr; $($arg:tt)*) => {{
        if $crate::logger::is_verbose() {
            $crate::logger::log($module, &format!($($arg)*))
        }
    }};
}

pub fn log(module: &str, message: &str) {
    let prefix = prefix(module);
    if is_diagnostic(module) {
        let mut err = stderr().lock();
        writeln!(err, "{prefix} {message}").ok();
        return;
    }

    let mut out = stdout().lock();
    // a progress line may still occupy the row
    execute!(out, Clear(ClearType::UntilNewLine)).ok();
    writeln!(out, "{prefix} {message}").ok();
    out.flush().ok();
}

fn is_diagnostic(module: &str) -> bool {
    module.eq_ignore_ascii_case("error") || module.eq_ignore_ascii_case("warning")
}

fn style_for(module: &str) -> Style {
    let style = Style::new().bold();
    match module.to_ascii_lowercase().as_str() {
        "serve" | "admin" => style.bright_blue(),
        "watch" | "relay" => style.bright_green(),
        "runtime" | "registry" => style.bright_cyan(),
        "error" => style.bright_red(),
        "warning" | "conflict" => style.bright_magenta(),
        _ => style.bright_yellow(),
    }
}

fn prefix(module: &str) -> String {
    format!("[{module}]").style(style_for(module)).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_contains_module_name() {
        assert!(prefix("queue").contains("[queue]"));
        assert!(prefix("Runtime").contains("[Runtime]"));
        assert_ne!(style_for("error"), style_for("relay"));
        assert_eq!(style_for("Runtime"), style_for("registry"));
    }

    #[test]
    fn test_diagnostic_modules() {
        assert!(is_diagnostic("error"));
        assert!(is_diagnostic("Warning"));
        assert!(!is_diagnostic("queue"));
    }

    #[test]
    fn test_verbose_toggle() {
        set_verbose(true);
        assert!(is_verbose());
        set_verbose(false);
        assert!(!is_verbose());
    }
}
