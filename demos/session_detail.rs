use std::error::Error;

use ig_stream_sdk::rest_api::{CredentialSource, RestClient, DEMO_API_PREFIX};
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let app_key = "REPLACE_WITH_APP_KEY".to_string();
    let identifier = "REPLACE_WITH_USERNAME".to_string();
    let password = "REPLACE_WITH_PASSWORD".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = RestClient::new(
            DEMO_API_PREFIX,
            app_key,
            identifier,
            SecretString::new(password),
        )?;

        let credentials = client.credentials().await?;
        println!(
            "account_id={} stream_endpoint={}",
            credentials.account_id, credentials.stream_endpoint
        );

        let accounts = client.api("accounts").await?;
        println!("{}", serde_json::to_string_pretty(&accounts)?);

        client.api("log_out").await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
