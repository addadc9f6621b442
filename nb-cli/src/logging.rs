use owo_colors::OwoColorize;
use std::sync::OnceLock;
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

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

pub fn category_demo() -> String {
    if ansi_enabled() {
        format!("{}", "DEMO".bright_green().bold())
    } else {
        "DEMO".to_string()
    }
}

pub fn abi_label(abi: &str) -> String {
    if ansi_enabled() {
        format!("{}", abi.bright_cyan().bold())
    } else {
        abi.to_string()
    }
}

/// Registers in blue, vector registers in magenta, stack slots in yellow.
pub fn location_label(location: &str) -> String {
    if !ansi_enabled() {
        return location.to_string();
    }

    if location.starts_with('[') {
        format!("{}", location.bright_yellow())
    } else if ["xmm", "fa", "s", "d"]
        .iter()
        .any(|prefix| location.starts_with(prefix))
    {
        format!("{}", location.bright_magenta())
    } else {
        format!("{}", location.bright_blue())
    }
}

pub fn outcome_label(passed: bool) -> String {
    let text = if passed { "ok" } else { "FAILED" };
    if !ansi_enabled() {
        return text.to_string();
    }

    if passed {
        format!("{}", text.bright_green())
    } else {
        format!("{}", text.bright_red().bold())
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
fn enable_ansi_support() -> windows::core::Result<()> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Console::{
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, GetConsoleMode, GetStdHandle, STD_OUTPUT_HANDLE,
        SetConsoleMode,
    };

    unsafe {
        let handle = GetStdHandle(STD_OUTPUT_HANDLE)?;
        if handle == HANDLE::default() {
            return Ok(());
        }

        let mut mode = std::mem::zeroed();
        GetConsoleMode(handle, &mut mode)?;
        SetConsoleMode(handle, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING)?;
        Ok(())
    }
}

#[cfg(not(windows))]
fn enable_ansi_support() -> Result<(), ()> {
    Err(())
}
