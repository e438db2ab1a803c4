use std::error::Error;

use ig_stream_sdk::rest_api::{RestClient, DEMO_API_PREFIX};
use ig_stream_sdk::stream::{
    StreamController, StreamOptions, SubscriptionConfig, SubscriptionEvent, SubscriptionMode,
};
use secrecy::SecretString;

fn main() -> Result<(), Box<dyn Error>> {
    let app_key = "REPLACE_WITH_APP_KEY".to_string();
    let identifier = "REPLACE_WITH_USERNAME".to_string();
    let password = "REPLACE_WITH_PASSWORD".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let rest = RestClient::new(
            DEMO_API_PREFIX,
            app_key,
            identifier,
            SecretString::new(password),
        )?;
        let mut controller = StreamController::new(rest, StreamOptions::default())?;

        let prices = controller.register_subscription(SubscriptionConfig::new(
            SubscriptionMode::Merge,
            ["BID", "OFFER", "UPDATE_TIME", "MARKET_STATE"],
            ["MARKET:CS.D.GBPUSD.TODAY.IP", "MARKET:IX.D.FTSE.DAILY.IP"],
        ))?;
        println!("registered prices subscription id={prices}");

        let mut events = controller
            .take_subscription_events()
            .ok_or("subscription events already taken")?;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SubscriptionEvent::Subscribed(id) => println!("subscribed id={id}"),
                    SubscriptionEvent::Rejected { id, body } => {
                        println!("subscription id={id} rejected: {body}")
                    }
                }
            }
        });

        controller.set_handler(|update| async move {
            let field = |name: &str| {
                update
                    .values
                    .get(name)
                    .cloned()
                    .flatten()
                    .unwrap_or_else(|| "-".to_string())
            };
            println!(
                "{} bid={} offer={} time={}",
                update.item_name,
                field("BID"),
                field("OFFER"),
                field("UPDATE_TIME"),
            );
        });

        controller.start().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
