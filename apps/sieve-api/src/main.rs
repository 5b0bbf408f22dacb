use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = sieve_api::Args::parse();

	sieve_api::run(args).await
}
