use clap::Parser;

use sieve_eval::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = Args::parse();

	sieve_eval::run(args).await
}
