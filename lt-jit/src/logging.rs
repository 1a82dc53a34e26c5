use owo_colors::OwoColorize;
use std::sync::OnceLock;
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

/// Installs the `fmt` subscriber: `info` unless `RUST_LOG` says otherwise.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let ansi = detect_ansi();
    let _ = ANSI_ENABLED.set(ansi);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

pub fn category_emit() -> String {
    paint("EMIT", |text| format!("{}", text.bright_cyan().bold()))
}

pub fn category_run() -> String {
    paint("RUN", |text| format!("{}", text.bright_green().bold()))
}

pub fn category_error() -> String {
    paint("ERROR", |text| format!("{}", text.bright_red().bold()))
}

/// Target names, colored by architecture family.
pub fn target_label(name: &str) -> String {
    if !ansi_enabled() {
        return name.to_string();
    }
    if name.starts_with("x86_64") {
        format!("{}", name.bright_blue())
    } else if name.starts_with("aarch64") {
        format!("{}", name.bright_magenta())
    } else {
        format!("{}", name.bright_white())
    }
}

fn paint(text: &str, style: impl FnOnce(&str) -> String) -> String {
    if ansi_enabled() {
        style(text)
    } else {
        text.to_string()
    }
}

fn ansi_enabled() -> bool {
    *ANSI_ENABLED.get_or_init(detect_ansi)
}

fn detect_ansi() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }

    if std::env::var_os("FORCE_COLOR").is_some() {
        let _ = enable_ansi_support();
        return true;
    }

    let windows_vt = enable_ansi_support().is_ok();
    windows_vt || supports_color::on_cached(Stream::Stdout).is_some()
}

#[cfg(windows)]
fn enable_ansi_support() -> Result<(), ()> {
    use windows_sys::Win32::System::Console::{
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, GetConsoleMode, GetStdHandle, STD_OUTPUT_HANDLE,
        SetConsoleMode,
    };

    unsafe {
        let handle = GetStdHandle(STD_OUTPUT_HANDLE);
        if handle.is_null() {
            return Err(());
        }
        let mut mode = 0;
        if GetConsoleMode(handle, &mut mode) == 0 {
            return Err(());
        }
        if SetConsoleMode(handle, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING) == 0 {
            return Err(());
        }
        Ok(())
    }
}

#[cfg(not(windows))]
fn enable_ansi_support() -> Result<(), ()> {
    Err(())
}
