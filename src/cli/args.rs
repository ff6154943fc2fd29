use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "torvm",
    version,
    about = "Transparent Tor-routing VM controller"
)]
pub struct Cli {
    /// Acceleration backend: kvm, hvf, whpx, tcg (auto-detected when omitted)
    #[arg(long)]
    pub accel: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    pub verbose: bool,

    /// Run without any status surface attached
    #[arg(long)]
    pub headless: bool,

    /// Path to JSON config file
    #[arg(long)]
    pub config: Option<String>,

    /// Remove the state disk before starting
    #[arg(long)]
    pub clean: bool,

    /// Replace the state disk with a fresh copy
    #[arg(long)]
    pub replace: bool,
}
