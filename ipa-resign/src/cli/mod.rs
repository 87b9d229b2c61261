// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod config;

use {
    crate::{
        cli::config::{Config, ConfigBuilder, SignConfig},
        error::ResignError,
        session::ResignSession,
        settings::VerificationMode,
        tools::{CodesignTool, SigningTool},
    },
    clap::{ArgAction, Parser, Subcommand},
    ipa_bundles::{BundleWalker, MachOInfo, SigningMode, SigningOrder},
    log::{warn, LevelFilter},
    std::path::PathBuf,
};

/// Holds state to pass to CLI commands.
pub struct Context {
    pub config: Config,
}

pub trait CliCommand {
    /// Obtain the current command arguments normalized to a [Config] instance.
    fn as_config(&self) -> Result<Option<Config>, ResignError> {
        Ok(None)
    }

    /// Runs the command.
    fn run(&self, context: &Context) -> Result<(), ResignError>;
}

fn runtime() -> Result<tokio::runtime::Runtime, ResignError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

/// `Some(true)` if a flag was given, otherwise defer to configuration.
fn flag(value: bool) -> Option<bool> {
    value.then_some(true)
}

#[derive(Parser)]
struct Sign {
    /// Path to the .ipa archive or .app directory to re-sign.
    input: PathBuf,

    /// Where to write the result.
    ///
    /// Defaults to `<name>-resigned.<ext>` next to the input.
    #[arg(short = 'o', long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// SHA-1 fingerprint or name of the code signing certificate.
    #[arg(short = 'i', long, value_name = "IDENTITY")]
    identity: Option<String>,

    /// Keychain to find the signing identity in.
    #[arg(long, value_name = "PATH")]
    keychain: Option<PathBuf>,

    /// Provisioning profile to embed.
    #[arg(short = 'm', long, value_name = "PATH")]
    mobileprovision: Option<PathBuf>,

    /// Sign independent binaries concurrently.
    #[arg(long)]
    parallel: bool,

    /// When to verify signatures.
    #[arg(long, value_enum, value_name = "MODE")]
    verify: Option<VerificationMode>,

    /// Treat verification failures as warnings.
    #[arg(long)]
    ignore_verification_errors: bool,

    /// Treat signing failures as warnings.
    ///
    /// A missing signing identity is always an error.
    #[arg(long)]
    ignore_codesign_errors: bool,

    /// Treat archive extraction and compression failures as warnings.
    #[arg(long)]
    ignore_zip_errors: bool,

    /// Continue when the main executable is encrypted.
    #[arg(long)]
    allow_encrypted: bool,

    /// Sign every Mach-O file, not just frameworks and bundle executables.
    #[arg(long)]
    all_binaries: bool,

    /// Additional attempts after a failed signing operation.
    #[arg(long, value_name = "COUNT")]
    sign_retries: Option<u32>,

    /// Change the bundle identifier.
    #[arg(long, value_name = "ID")]
    bundle_id: Option<String>,

    /// Entitlements plist to use instead of the provisioning profile's.
    #[arg(short = 'e', long, value_name = "PATH")]
    entitlements: Option<PathBuf>,

    /// Remove entitlements the new identity is unlikely to be provisioned for.
    #[arg(long)]
    massage_entitlements: bool,

    /// Keychain access group to add to the entitlements.
    #[arg(long = "add-access-group", value_name = "GROUP")]
    access_group: Option<String>,

    /// Declare support for both iPhone and iPad.
    #[arg(long)]
    force_family: bool,

    /// Allow arbitrary loads over plain HTTP.
    #[arg(long)]
    allow_http: bool,

    /// Set the minimum OS version.
    #[arg(long, value_name = "VERSION")]
    min_os_version: Option<String>,

    /// Remove the UISupportedDevices restriction.
    #[arg(long)]
    remove_supported_devices: bool,

    /// Remove the embedded watch application.
    #[arg(long)]
    without_watchapp: bool,

    /// Remove app extensions.
    #[arg(long)]
    without_plugins: bool,

    /// Remove XCTest bundles.
    #[arg(long)]
    without_xctests: bool,

    /// Keep the temporary workspace.
    #[arg(long = "no-clean")]
    keep_temporary: bool,
}

impl CliCommand for Sign {
    fn as_config(&self) -> Result<Option<Config>, ResignError> {
        Ok(Some(Config {
            sign: SignConfig {
                identity: self.identity.clone(),
                keychain: self.keychain.clone(),
                mobileprovision: self.mobileprovision.clone(),
                parallel: flag(self.parallel),
                verify: self.verify,
                ignore_verification_errors: flag(self.ignore_verification_errors),
                ignore_codesign_errors: flag(self.ignore_codesign_errors),
                ignore_zip_errors: flag(self.ignore_zip_errors),
                allow_encrypted: flag(self.allow_encrypted),
                all_binaries: flag(self.all_binaries),
                sign_retries: self.sign_retries,
                bundle_id: self.bundle_id.clone(),
                entitlements: self.entitlements.clone(),
                massage_entitlements: flag(self.massage_entitlements),
                access_group: self.access_group.clone(),
                force_family: flag(self.force_family),
                allow_http: flag(self.allow_http),
                min_os_version: self.min_os_version.clone(),
                remove_supported_devices: flag(self.remove_supported_devices),
                without_watchapp: flag(self.without_watchapp),
                without_plugins: flag(self.without_plugins),
                without_xctests: flag(self.without_xctests),
                keep_temporary: flag(self.keep_temporary),
            },
            ..Default::default()
        }))
    }

    fn run(&self, context: &Context) -> Result<(), ResignError> {
        let settings = context.config.resign_settings(self.output.clone());
        let session = ResignSession::with_codesign(settings);

        let outcome = runtime()?.block_on(session.run(&self.input))?;

        if !outcome.warnings.is_empty() {
            warn!("completed with {} warnings", outcome.warnings.len());
        }
        if let Some(workspace) = &outcome.workspace {
            warn!("workspace retained at {}", workspace.display());
        }
        println!("{}", outcome.output.display());

        Ok(())
    }
}

#[derive(Parser)]
struct Inspect {
    /// Path to a Mach-O binary.
    path: PathBuf,
}

impl CliCommand for Inspect {
    fn run(&self, _context: &Context) -> Result<(), ResignError> {
        let info = MachOInfo::from_path(&self.path)?;

        println!("architectures: {}", info.architectures.join(", "));
        println!("encrypted: {}", info.encrypted);
        println!("bitcode only: {}", info.bitcode_only);
        if let Some(identifier) = &info.identifier {
            println!("signature identifier: {}", identifier);
        }
        println!("libraries:");
        for library in &info.libraries {
            println!("  {} ({:?})", library.name, library.kind);
        }
        println!("rpaths:");
        for rpath in &info.rpaths {
            println!("  {}", rpath);
        }
        if let Some(entitlements) = &info.entitlements {
            println!("entitlements:");
            println!("{}", entitlements);
        }

        Ok(())
    }
}

#[derive(Parser)]
struct PrintSigningOrder {
    /// Path to an .app directory.
    app_dir: PathBuf,

    /// Print layers of binaries that may be signed concurrently.
    #[arg(long)]
    parallel: bool,

    /// Include every Mach-O file, not just frameworks and bundle executables.
    #[arg(long)]
    all_binaries: bool,
}

impl CliCommand for PrintSigningOrder {
    fn run(&self, _context: &Context) -> Result<(), ResignError> {
        let bundle = BundleWalker::new()
            .all_binaries(self.all_binaries)
            .discover(&self.app_dir)?;

        let mode = if self.parallel {
            SigningMode::Parallel
        } else {
            SigningMode::Serial
        };

        let display = |p: &std::path::Path| {
            p.strip_prefix(&bundle.root)
                .unwrap_or(p)
                .display()
                .to_string()
        };

        match bundle.signing_order(mode)? {
            SigningOrder::Serial(paths) => {
                for path in paths {
                    println!("{}", display(path.as_path()));
                }
            }
            SigningOrder::Layered(layers) => {
                for (i, layer) in layers.iter().enumerate() {
                    println!("layer {}:", i);
                    for path in layer {
                        println!("  {}", display(path.as_path()));
                    }
                }
            }
        }

        for path in &bundle.skipped {
            println!("skipped: {}", display(path.as_path()));
        }

        Ok(())
    }
}

#[derive(Parser)]
struct ListIdentities {
    /// Keychain to search instead of the default search list.
    #[arg(long, value_name = "PATH")]
    keychain: Option<PathBuf>,
}

impl CliCommand for ListIdentities {
    fn run(&self, context: &Context) -> Result<(), ResignError> {
        let tool = CodesignTool::new(context.config.tools.tool_paths());

        let identities = runtime()?.block_on(tool.identities(self.keychain.as_deref()))?;

        for identity in identities {
            println!("{} {}", identity.fingerprint, identity.name);
        }

        Ok(())
    }
}

#[derive(Subcommand)]
enum Subcommands {
    /// Re-sign an .ipa archive or .app directory
    Sign(Sign),

    /// Print information about a Mach-O binary
    Inspect(Inspect),

    /// Print the order binaries in an .app directory would be signed in
    PrintSigningOrder(PrintSigningOrder),

    /// List code signing identities available in keychains
    ListIdentities(ListIdentities),
}

impl Subcommands {
    fn as_cli_command(&self) -> &dyn CliCommand {
        match self {
            Subcommands::Sign(c) => c,
            Subcommands::Inspect(c) => c,
            Subcommands::PrintSigningOrder(c) => c,
            Subcommands::ListIdentities(c) => c,
        }
    }
}

/// Re-sign iOS applications with a different signing identity.
#[derive(Parser)]
#[command(author, version, arg_required_else_help = true)]
struct Cli {
    /// Explicit configuration file to load.
    ///
    /// If provided, the default configuration files are not loaded, even
    /// if they exist.
    ///
    /// Can be specified multiple times. Files are loaded/merged in the order
    /// given.
    ///
    /// The special value `/dev/null` can be used to specify an empty/null
    /// config file. It can be used to short-circuit loading of default config
    /// files.
    #[arg(short = 'C', long = "config-file", global = true)]
    config_path: Vec<PathBuf>,

    /// Configuration profile to load.
    ///
    /// If not specified, the implicit "default" profile is loaded.
    #[arg(short = 'P', long, global = true)]
    profile: Option<String>,

    /// Increase logging verbosity. Can be specified multiple times
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Subcommands,
}

impl Cli {
    pub fn config_builder(&self) -> ConfigBuilder {
        let mut config = ConfigBuilder::default();

        config = if self.config_path.is_empty() {
            config.with_user_config_file().with_cwd_config_file()
        } else {
            for path in &self.config_path {
                if path.display().to_string() == "/dev/null" {
                    break;
                }

                config = config.toml_file(path);
            }

            config
        };

        if let Some(profile) = &self.profile {
            config = config.profile(profile.to_string());
        }

        // Environment variables override config files.
        config = config.with_env_prefix();

        config
    }
}

pub fn main_impl() -> Result<(), ResignError> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    let mut config_builder = cli.config_builder();

    let command = cli.command.as_cli_command();

    if let Some(config) = command.as_config()? {
        config_builder = config_builder.with_config_struct(config);
    }

    let config = config_builder.config()?;

    let context = Context { config };

    command.run(&context)
}
