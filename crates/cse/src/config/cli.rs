use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use utils::version;

/// Env var holding the config password, checked before prompting.
pub const PASSWORD_ENV_VAR: &str = "CSE_CONFIG_PASSWORD";

#[derive(Parser)]
#[command(name = "cse", about = "Container Service Extension for VMware Cloud Director", long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "CSE_LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for the rotating log files"
    )]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install CSE on vCloud Director
    Install(InstallArgs),
    /// Upgrade an existing CSE installation
    Upgrade(UpgradeArgs),
    /// Run the CSE server
    Run(RunArgs),
    /// Validate a config file and, optionally, the installation it describes
    Check(CheckArgs),
    /// Print sample config files
    Sample(SampleArgs),
    /// Encrypt a config file
    Encrypt(CryptArgs),
    /// Decrypt a config file
    Decrypt(CryptArgs),
    /// Manage kubernetes templates
    #[command(subcommand)]
    Template(TemplateCommands),
    /// Create the CSE Service Role in the System org
    #[command(name = "create-service-role")]
    CreateServiceRole(ServiceRoleArgs),
    /// Validate a PKS config file and stamp PKS metadata on org VDCs
    #[command(name = "pks-configure")]
    PksConfigure(PksConfigureArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ConfigArgs {
    #[arg(
        short = 'c',
        long = "config",
        env = "CSE_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the CSE config file"
    )]
    pub config: PathBuf,

    #[arg(
        short = 's',
        long,
        help = "Config file is plain text; do not decrypt it"
    )]
    pub skip_config_decryption: bool,
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(short = 'p', long, value_hint = clap::ValueHint::FilePath, help = "PKS config file")]
    pub pks_config_file: Option<PathBuf>,

    #[arg(short = 't', long, help = "Do not create kubernetes templates")]
    pub skip_template_creation: bool,

    #[arg(long, help = "Keep the temporary vApp used to build templates")]
    pub retain_temp_vapp: bool,

    #[arg(long, value_hint = clap::ValueHint::FilePath, help = "Public key added to template VMs")]
    pub ssh_key: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct UpgradeArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(short = 't', long, help = "Do not re-create kubernetes templates")]
    pub skip_template_creation: bool,

    #[arg(long, help = "Keep the temporary vApp used to build templates")]
    pub retain_temp_vapp: bool,

    #[arg(long, value_hint = clap::ValueHint::FilePath, help = "Public key added to template VMs")]
    pub ssh_key: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(short = 'p', long, value_hint = clap::ValueHint::FilePath, help = "PKS config file")]
    pub pks_config_file: Option<PathBuf>,

    #[arg(long, help = "Skip the installation check at startup")]
    pub skip_check: bool,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(short = 'p', long, value_hint = clap::ValueHint::FilePath, help = "PKS config file")]
    pub pks_config_file: Option<PathBuf>,

    #[arg(short = 'i', long, help = "Also check the CSE installation on vCD")]
    pub check_install: bool,
}

#[derive(Args, Debug)]
pub struct SampleArgs {
    #[arg(short = 'o', long, value_hint = clap::ValueHint::FilePath, help = "Write the sample to this file")]
    pub output: Option<PathBuf>,

    #[arg(long, help = "Print a sample PKS config instead")]
    pub pks_config: bool,

    #[arg(long, help = "Sample for a legacy (AMQP) installation")]
    pub legacy_mode: bool,
}

#[derive(Args, Debug)]
pub struct CryptArgs {
    #[arg(value_hint = clap::ValueHint::FilePath, help = "Input file")]
    pub input: PathBuf,

    #[arg(short = 'o', long, value_hint = clap::ValueHint::FilePath, help = "Output file, stdout when omitted")]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum TemplateCommands {
    /// List templates of the remote cookbook and the local catalog
    List(TemplateListArgs),
    /// Build a template from the remote cookbook
    Install(TemplateInstallArgs),
    /// Import a template OVA into the catalog
    Import(TemplateImportArgs),
}

#[derive(Args, Debug)]
pub struct TemplateListArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(short = 'a', long, help = "Show templates unsupported by this CSE version too")]
    pub display_all: bool,
}

#[derive(Args, Debug)]
pub struct TemplateInstallArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(help = "Template name, '*' for all")]
    pub template_name: String,

    #[arg(help = "Template revision, '*' for all")]
    pub template_revision: String,

    #[arg(short = 'f', long, help = "Re-create the template even if it exists")]
    pub force: bool,

    #[arg(long, help = "Keep the temporary vApp used to build templates")]
    pub retain_temp_vapp: bool,

    #[arg(long, value_hint = clap::ValueHint::FilePath, help = "Public key added to template VMs")]
    pub ssh_key: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct TemplateImportArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(short = 'F', long, value_hint = clap::ValueHint::FilePath, help = "Path of the TKGm OVA")]
    pub file: PathBuf,

    #[arg(short = 'f', long, help = "Replace the catalog item if it exists")]
    pub force: bool,

    #[arg(long, help = "Override the derived template name")]
    pub template_name: Option<String>,

    #[arg(long, help = "Override the template revision")]
    pub template_revision: Option<u32>,
}

#[derive(Args, Debug)]
pub struct ServiceRoleArgs {
    #[arg(help = "vCD host")]
    pub vcd_host: String,

    #[arg(short = 'u', long, default_value = "administrator")]
    pub username: String,

    #[arg(long, env = "CSE_VCD_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, default_value = "36.0")]
    pub api_version: String,

    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Verify the vCD certificate"
    )]
    pub verify: bool,
}

#[derive(Args, Debug)]
pub struct PksConfigureArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[arg(short = 'p', long, value_hint = clap::ValueHint::FilePath, help = "PKS config file")]
    pub pks_config_file: PathBuf,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn install_flags_parse() {
        let cli = Cli::try_parse_from([
            "cse", "install", "-c", "config.yaml", "-s", "-t", "--retain-temp-vapp",
        ])
        .expect("parse");
        let Commands::Install(args) = cli.command else {
            panic!("expected install");
        };
        assert_eq!(args.config.config, PathBuf::from("config.yaml"));
        assert!(args.config.skip_config_decryption);
        assert!(args.skip_template_creation);
        assert!(args.retain_temp_vapp);
        assert!(args.pks_config_file.is_none());
    }

    #[test]
    fn template_import_parses() {
        let cli = Cli::try_parse_from([
            "cse", "template", "import", "-c", "c.yaml", "-F", "ubuntu-2004-kube-v1.20.5.ova",
        ])
        .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Template(TemplateCommands::Import(_))
        ));
    }
}
