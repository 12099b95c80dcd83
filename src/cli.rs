use clap::Parser;

/// Talk to your task assistant
#[derive(Parser, Debug)]
#[command(name = "zenflow-voice", version, about, long_about = None)]
pub struct Cli {
    /// Name the assistant addresses you by
    #[arg(short, long, default_value = "admin")]
    pub user: String,

    /// Override the configured model
    #[arg(short, long)]
    pub model: Option<String>,

    /// Print the available audio devices and exit
    #[arg(long)]
    pub list_devices: bool,
}

#[cfg(feature = "device")]
pub fn run() -> Result<(), crate::VoiceError> {
    use std::sync::Arc;

    use crate::audio::{CpalCapture, CpalDevices, CpalPlayback};
    use crate::config::VoiceConfig;
    use crate::live::GeminiLiveConnector;
    use crate::voice::{UserContext, VoiceSessionController};

    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    if cli.list_devices {
        for name in CpalCapture::list_devices()? {
            println!("input:  {}", name);
        }
        for name in CpalPlayback::list_devices()? {
            println!("output: {}", name);
        }
        return Ok(());
    }

    let mut config = VoiceConfig::load();
    if let Some(model) = cli.model {
        config.model = model;
    }

    let connector = GeminiLiveConnector::new(&config.endpoint, config.require_api_key()?);
    let devices = CpalDevices::with_devices(config.input_device.clone(), config.output_device.clone());
    let controller = VoiceSessionController::new(config, Arc::new(connector), Arc::new(devices));

    let user = UserContext::new(&cli.user);
    let runtime = tokio::runtime::Runtime::new().map_err(|e| crate::VoiceError::Config(e.to_string()))?;
    runtime.block_on(converse(&controller, &user))
}

/// Run one session until Ctrl-C or until the service closes it
#[cfg(feature = "device")]
async fn converse(
    controller: &crate::VoiceSessionController,
    user: &crate::UserContext,
) -> Result<(), crate::VoiceError> {
    tokio::select! {
        started = controller.start(user) => { started?; }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted while connecting");
            controller.stop().await;
            return Ok(());
        }
    }
    println!("Listening, press Ctrl-C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        _ = controller.wait_closed() => tracing::info!("Session closed by the service"),
    }

    if let Some(summary) = controller.stop().await {
        if let Some(error) = summary.error {
            tracing::error!("Session ended with an error: {}", error);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["zenflow-voice"]).unwrap();
        assert_eq!(cli.user, "admin");
        assert_eq!(cli.model, None);
        assert!(!cli.list_devices);
    }

    #[test]
    fn test_user_and_model() {
        let cli = Cli::try_parse_from(["zenflow-voice", "--user", "alice", "-m", "other-model"]).unwrap();
        assert_eq!(cli.user, "alice");
        assert_eq!(cli.model.as_deref(), Some("other-model"));
    }
}
