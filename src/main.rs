use clap::Parser;

#[cfg(target_os = "macos")]
use clap::{ColorChoice, CommandFactory, FromArgMatches};

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = parse_cli();
    if let Err(err) = odeon::run(&cli) {
        odeon::write_cli_error(&err, &mut std::io::stderr())?;
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn parse_cli() -> odeon::Cli {
    let matches = odeon::Cli::command()
        .color(ColorChoice::Never)
        .get_matches();
    odeon::Cli::from_arg_matches(&matches).unwrap_or_else(|err| err.exit())
}

#[cfg(not(target_os = "macos"))]
fn parse_cli() -> odeon::Cli {
    odeon::Cli::parse()
}
