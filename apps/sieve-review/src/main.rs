use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = sieve_review::Args::parse();

	sieve_review::run(args).await
}
