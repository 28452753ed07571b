//! Terminal prompts.

use std::io::Write;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use crossterm::event;
use crossterm::event::Event;
use crossterm::event::KeyCode;
use crossterm::event::KeyEventKind;
use crossterm::event::KeyModifiers;
use crossterm::terminal;

use crate::config::cli::PASSWORD_ENV_VAR;

/// Restores cooked mode when dropped, including on early return.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("enable raw terminal mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Reads a line from the terminal without echoing it.
pub fn read_hidden(prompt: &str) -> Result<String> {
    let mut stderr = std::io::stderr();
    write!(stderr, "{prompt}")?;
    stderr.flush()?;

    let mut input = String::new();
    {
        let _raw = RawModeGuard::enable()?;
        loop {
            let Event::Key(key) = event::read().context("read key")? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Enter => break,
                KeyCode::Backspace => {
                    input.pop();
                }
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    drop(_raw);
                    writeln!(stderr)?;
                    bail!("password prompt interrupted");
                }
                KeyCode::Char(c) => input.push(c),
                KeyCode::Esc => {
                    input.clear();
                    break;
                }
                _ => {}
            }
        }
    }
    writeln!(stderr)?;
    Ok(input)
}

/// Config password from the environment, or asked for.
pub fn config_password() -> Result<String> {
    if let Some(password) = std::env::var(PASSWORD_ENV_VAR).ok().filter(|p| !p.is_empty()) {
        return Ok(password);
    }
    let password = read_hidden("Password for config file decryption: ")?;
    if password.is_empty() {
        bail!("empty password, set {PASSWORD_ENV_VAR} or type one");
    }
    Ok(password)
}

/// Password for a new encrypted file, asked twice.
pub fn new_password() -> Result<String> {
    if let Some(password) = std::env::var(PASSWORD_ENV_VAR).ok().filter(|p| !p.is_empty()) {
        return Ok(password);
    }
    let password = read_hidden("Password for config file encryption: ")?;
    let again = read_hidden("Confirm password: ")?;
    if password != again {
        bail!("passwords do not match");
    }
    if password.is_empty() {
        bail!("empty password");
    }
    Ok(password)
}
