//! `sample`, `encrypt` and `decrypt`.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing::info;
use tracing::warn;

use super::IntoAnyhow;
use crate::config::cli::CryptArgs;
use crate::config::cli::SampleArgs;
use crate::config::encryption;
use crate::config::sample;
use crate::config::write_private;

fn emit(output: Option<&Path>, content: &str) -> Result<()> {
    match output {
        Some(path) => {
            write_private(path, content).into_anyhow()?;
            info!(path = %path.display(), "Wrote file");
        }
        None => print!("{content}"),
    }
    Ok(())
}

pub fn run_sample(args: SampleArgs) -> Result<()> {
    let content = if args.pks_config {
        sample::sample_pks_config()
    } else {
        sample::sample_config(args.legacy_mode)
    };
    emit(args.output.as_deref(), &content)
}

pub fn run_encrypt(args: CryptArgs) -> Result<()> {
    let plain = std::fs::read_to_string(&args.input)
        .with_context(|| format!("read {}", args.input.display()))?;
    let password = super::prompt::new_password()?;
    let token = encryption::encrypt(&plain, &password)?;
    emit(args.output.as_deref(), &token)
}

pub fn run_decrypt(args: CryptArgs) -> Result<()> {
    let token = std::fs::read_to_string(&args.input)
        .with_context(|| format!("read {}", args.input.display()))?;
    let password = super::prompt::config_password()?;
    let decrypted = encryption::decrypt(token.trim(), &password)
        .with_context(|| format!("decrypt {}", args.input.display()))?;
    if decrypted.used_legacy_key {
        warn!("File was encrypted with a deprecated key, re-encrypt it with 'cse encrypt'");
    }
    emit(args.output.as_deref(), &decrypted.content)
}
