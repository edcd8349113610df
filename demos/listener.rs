use carrot_hutch::amqp::configuration::RabbitMqSettings;
use carrot_hutch::consumers::{ClosureHandler, HandlerError, JsonDecoder, ListenerSettings, MessageListener};
use carrot_hutch::lifecycle::ServiceGroup;
use carrot_hutch::publishers::PublishMessage;
use carrot_hutch::transport::Message;
use carrot_hutch::ConnectionHolder;
use std::sync::Arc;

#[derive(serde::Deserialize, serde::Serialize)]
struct Greeting {
    name: String,
}

async fn greet(greeting: Greeting) -> Result<(), HandlerError> {
    if greeting.name.is_empty() {
        // Retrying will not give the greeting a name.
        return Err(HandlerError::avoid_requeue(anyhow::anyhow!("Nameless greeting")));
    }
    println!("Hello {}!", greeting.name);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // The out-of-the-box parameters match the default RabbitMq Docker image.
    let settings = RabbitMqSettings::default();
    let holder = ConnectionHolder::from_settings(&settings)?;
    holder.start()?;

    // Listeners get a channel of their own: the prefetch count is a channel-wide setting.
    let channel = holder.acquire_channel().await?;
    let listener_settings = ListenerSettings {
        queue_name: "greetings".into(),
        prefetch_count: Some(16),
        options: Default::default(),
    };
    let listener = Arc::new(
        MessageListener::from_settings(
            &*channel,
            &listener_settings,
            JsonDecoder::<Greeting>::new(),
            ClosureHandler(greet),
        )
        .await?,
    );

    for name in ["Ferris", "Corro", ""] {
        let message = Message::json(&Greeting { name: name.into() })?;
        PublishMessage::new(message, "", "greetings")
            .via_holder(&holder)
            .send()
            .await?;
    }

    let result = ServiceGroup::new()
        .service(listener)
        .run_until_sigterm()
        .await;

    // Checked-out channels hold up the shutdown of the pools.
    drop(channel);
    holder.stop().await;
    result
}
