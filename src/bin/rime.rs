use anyhow::{Context, Result};
use clap::Parser;
use rime::{load_file, VirtualMachine};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rime")]
#[command(about = "The Rime virtual machine")]
struct Cli {
    /// Path to a compiled program image
    image: String,

    /// Print the image's disassembly instead of running it
    #[arg(long)]
    disassemble: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let program =
        load_file(&cli.image).with_context(|| format!("Failed to load image: {}", cli.image))?;

    if cli.disassemble {
        print!("{}", program.disassemble());
        return Ok(());
    }

    let mut vm = VirtualMachine::new(program).context("Failed to initialize the machine")?;
    match vm.run() {
        Ok(status) => std::process::exit(status as i32),
        Err(diagnostic) => {
            eprintln!("{}", diagnostic);
            std::process::exit(1);
        }
    }
}
