use std::sync::Arc;

use sieve_service::SieveService;

#[derive(Clone)]
pub struct AppState {
	pub service: Arc<SieveService>,
}
impl AppState {
	pub async fn new(config: sieve_config::Config) -> color_eyre::Result<Self> {
		let service = SieveService::connect(config).await?;

		Ok(Self::from_service(service))
	}

	pub fn from_service(service: SieveService) -> Self {
		Self { service: Arc::new(service) }
	}
}
