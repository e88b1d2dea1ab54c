//! Output helpers shared by every subcommand.
//!
//! Global flags are published as `TRELLIS_*` environment variables by
//! `main`, so command code can check them without threading them through.

use serde::Serialize;

pub fn is_json() -> bool {
    std::env::var_os("TRELLIS_JSON").is_some()
}

pub fn is_quiet() -> bool {
    std::env::var_os("TRELLIS_QUIET").is_some()
}

pub fn is_verbose() -> bool {
    std::env::var_os("TRELLIS_VERBOSE").is_some()
}

/// Pretty-print a value as JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("  Error: could not serialize output: {e}"),
    }
}

/// Print one JSON value per line (event streams).
pub fn print_json_line<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("  Error: could not serialize output: {e}"),
    }
}

/// Status markers for human-readable output.
pub struct Styled {
    color: bool,
}

impl Styled {
    pub fn new() -> Self {
        let color = std::env::var_os("TRELLIS_NO_COLOR").is_none()
            && std::env::var_os("NO_COLOR").is_none();
        Self { color }
    }

    pub fn ok_sym(&self) -> &'static str {
        if self.color {
            "\x1b[32m✓\x1b[0m"
        } else {
            "[OK]"
        }
    }

    pub fn fail_sym(&self) -> &'static str {
        if self.color {
            "\x1b[31m✗\x1b[0m"
        } else {
            "[!!]"
        }
    }

    pub fn warn_sym(&self) -> &'static str {
        if self.color {
            "\x1b[33m!\x1b[0m"
        } else {
            "[??]"
        }
    }

    pub fn dim(&self, text: &str) -> String {
        if self.color {
            format!("\x1b[2m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }
}
