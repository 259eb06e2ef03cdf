//! Command-line interface argument parsing and definitions
//!
//! This module defines the CLI structure using clap's derive API.

use clap::{Parser, Subcommand, ValueEnum};
use is_terminal::IsTerminal;
use std::path::PathBuf;

/// cmarshal - call into native C libraries from declarations
///
/// Inspect computed struct layouts, check that every declared symbol binds,
/// and call single native functions with typed literal arguments.
#[derive(Parser, Debug)]
#[command(
    name = "cmarshal",
    version,
    author,
    about,
    long_about = None,
    propagate_version = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Enable verbose output (can be used multiple times for increased verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "CMARSHAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format for results
    #[arg(short, long, value_enum, global = true, default_value = "human")]
    pub output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// The subcommand to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the computed layout of every declared struct
    Layout(LayoutArgs),

    /// Open every declared library and bind every declared function
    Check(CheckArgs),

    /// Bind one symbol and call it with typed literal arguments
    Call(CallArgs),

    /// Run the built-in smoke test against system libraries
    Smoke(SmokeArgs),

    /// Manage configuration files and settings
    Config(ConfigArgs),

    /// Generate shell completions for the specified shell
    Completions(CompletionsArgs),
}

/// Arguments for the layout command
#[derive(Parser, Debug)]
pub struct LayoutArgs {
    /// Declarations file (JSON or YAML); defaults to the configured one
    #[arg(value_name = "DECLARATIONS")]
    pub declarations: Option<PathBuf>,

    /// Only show these layouts
    #[arg(short, long = "name", value_name = "LAYOUT")]
    pub names: Vec<String>,
}

/// Arguments for the check command
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Declarations file (JSON or YAML); defaults to the configured one
    #[arg(value_name = "DECLARATIONS")]
    pub declarations: Option<PathBuf>,

    /// Extra directory to search for relative library paths
    #[arg(short = 'L', long = "search-dir", value_name = "DIR")]
    pub search_dirs: Vec<PathBuf>,
}

/// Arguments for the call command
#[derive(Parser, Debug)]
pub struct CallArgs {
    /// Symbol to bind
    #[arg(value_name = "SYMBOL")]
    pub symbol: String,

    /// Argument literals, one per parameter. Integers, floats and booleans
    /// are written as usual; `null` is NULL; records are JSON objects.
    #[arg(value_name = "ARG", allow_negative_numbers = true)]
    pub args: Vec<String>,

    /// Library to open; omit to bind from the running process
    #[arg(short, long, value_name = "PATH")]
    pub library: Option<PathBuf>,

    /// Return kind, e.g. int32 or struct<TimeVal>
    #[arg(short, long, value_name = "KIND")]
    pub returns: Option<String>,

    /// Parameter kind, repeated once per parameter
    #[arg(short, long = "param", value_name = "KIND")]
    pub params: Vec<String>,

    /// Mark the function variadic with this many fixed parameters
    #[arg(long, value_name = "FIXED")]
    pub variadic: Option<usize>,

    /// Load flags, e.g. "RESOLVE_LAZY | SCOPE_GLOBAL"
    #[arg(long, value_name = "FLAGS")]
    pub flags: Option<String>,

    /// Declarations file providing layouts and, when the symbol is declared
    /// there, the library and signature
    #[arg(short, long, value_name = "FILE")]
    pub declarations: Option<PathBuf>,

    /// Run the call on a background worker thread
    #[arg(long = "async")]
    pub background: bool,
}

/// Arguments for the smoke command
#[derive(Parser, Debug)]
pub struct SmokeArgs {
    /// Path to the cmarshal-testlib shared library; enables the struct checks
    #[arg(long, value_name = "PATH")]
    pub testlib: Option<PathBuf>,

    /// Math library to load `ceil` from
    #[arg(long, value_name = "PATH")]
    pub libm: Option<PathBuf>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write a default configuration file
    Init(ConfigInitArgs),

    /// Show the effective configuration
    Show(ConfigShowArgs),

    /// List the locations searched for a configuration file
    Paths,
}

/// Arguments for config init
#[derive(Parser, Debug)]
pub struct ConfigInitArgs {
    /// Write the user config instead of `.cmarshal.yaml` in the current directory
    #[arg(long)]
    pub user: bool,

    /// Overwrite an existing file
    #[arg(short, long)]
    pub force: bool,
}

/// Arguments for config show
#[derive(Parser, Debug)]
pub struct ConfigShowArgs {
    /// Serialization format
    #[arg(short, long, value_enum, default_value = "yaml")]
    pub format: ConfigFormat,
}

/// Configuration file formats
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    /// TOML format
    Toml,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Arguments for generating shell completions
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

/// Output format options
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable formatted output
    Human,
    /// JSON output
    Json,
    /// YAML output
    Yaml,
    /// Pretty-printed JSON output
    JsonPretty,
}

/// Supported shells for completion generation
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the effective verbosity level (considering quiet flag)
    pub fn verbosity_level(&self) -> u8 {
        if self.quiet {
            0
        } else {
            self.verbose
        }
    }

    /// Check if colored output should be used
    pub fn use_color(&self) -> bool {
        !self.no_color && std::io::stdout().is_terminal()
    }
}

impl Shell {
    /// Convert to clap_complete shell type
    pub fn to_clap_shell(self) -> clap_complete::Shell {
        match self {
            Shell::Bash => clap_complete::Shell::Bash,
            Shell::Zsh => clap_complete::Shell::Zsh,
            Shell::Fish => clap_complete::Shell::Fish,
            Shell::PowerShell => clap_complete::Shell::PowerShell,
            Shell::Elvish => clap_complete::Shell::Elvish,
        }
    }
}
