use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::{ArgAction, Parser};

use earshot_proto::NetConfig;

/// World coordinates are tenths of a stud; operators configure distances in
/// studs.
const UNITS_PER_STUD: f32 = 10.0;

#[derive(Debug, Parser)]
#[command(
    name = "earshot-bridge",
    author,
    version,
    about = "Positional voice chat bridge for a Brickadia server"
)]
pub struct Cli {
    /// Address to bind the voice websocket listener to.
    #[arg(long, env = "EARSHOT_LISTEN_ADDR", default_value = "127.0.0.1:8060")]
    listen_addr: String,

    /// Telemetry polling interval in milliseconds.
    #[arg(long, env = "EARSHOT_POLL_INTERVAL_MS", default_value_t = 250)]
    poll_interval_ms: u64,

    /// Maximum time to wait for one host request.
    #[arg(long, env = "EARSHOT_CONSOLE_TIMEOUT_SECS", default_value_t = 10)]
    console_timeout_secs: u64,

    /// Maximum time clients have to send their hello frame.
    #[arg(long, env = "EARSHOT_HANDSHAKE_TIMEOUT_SECS", default_value_t = 5)]
    handshake_timeout_secs: u64,

    /// Server name used when the game directory is unreachable.
    #[arg(long, env = "EARSHOT_SERVER_NAME", default_value = "Brickadia Server")]
    server_name: String,

    /// Host name used when the game directory is unreachable.
    #[arg(long, env = "EARSHOT_HOST_NAME", default_value = "Host")]
    host_name: String,

    /// Audible radius in studs.
    #[arg(long, env = "EARSHOT_MAX_DISTANCE", default_value_t = 100.0)]
    max_distance: f32,

    /// Exponential volume falloff factor; higher decays faster.
    #[arg(long, env = "EARSHOT_FALLOFF_FACTOR", default_value_t = 2.0)]
    falloff_factor: f32,

    /// Attenuate voices by distance.
    #[arg(long, env = "EARSHOT_PROXIMITY", default_value_t = true, action = ArgAction::Set)]
    proximity: bool,

    /// Pan voices across the stereo field by bearing.
    #[arg(long, env = "EARSHOT_PANNING", default_value_t = true, action = ArgAction::Set)]
    panning: bool,

    /// Let dead players keep speaking spatially.
    #[arg(long, env = "EARSHOT_VOICE_WHEN_DEAD", default_value_t = false, action = ArgAction::Set)]
    voice_when_dead: bool,

    /// Route dead players to each other at full volume.
    #[arg(long, env = "EARSHOT_DEAD_NON_PROXIMITY", default_value_t = true, action = ArgAction::Set)]
    dead_non_proximity: bool,

    /// Minimap scale factor sent to clients.
    #[arg(long, env = "EARSHOT_MAP_SCALE", default_value_t = 0.3)]
    map_scale: f32,

    /// Read incoming voice events aloud with TTS.
    #[arg(long, env = "EARSHOT_TTS", default_value_t = false, action = ArgAction::Set)]
    tts: bool,

    /// Relay game chat into the client overlay.
    #[arg(long, env = "EARSHOT_SHOW_CHAT", default_value_t = true, action = ArgAction::Set)]
    show_chat: bool,

    /// Read relayed game chat aloud with TTS.
    #[arg(long, env = "EARSHOT_CHAT_TTS", default_value_t = false, action = ArgAction::Set)]
    chat_tts: bool,

    /// Show non-teammates on the client minimap.
    #[arg(long, env = "EARSHOT_OTHERS_ON_MINIMAP", default_value_t = true, action = ArgAction::Set)]
    others_on_minimap: bool,

    /// Show teammates on the client minimap.
    #[arg(long, env = "EARSHOT_TEAMMATES_ON_MINIMAP", default_value_t = true, action = ArgAction::Set)]
    teammates_on_minimap: bool,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen_addr: SocketAddr,
    pub poll_interval: Duration,
    pub console_timeout: Duration,
    pub handshake_timeout: Duration,
    pub server_name: String,
    pub host_name: String,
    pub net: NetConfig,
}

impl TryFrom<Cli> for BridgeConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(BridgeConfig {
            listen_addr,
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            console_timeout: Duration::from_secs(cli.console_timeout_secs),
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            server_name: cli.server_name,
            host_name: cli.host_name,
            net: NetConfig {
                max_voice_distance: cli.max_distance * UNITS_PER_STUD,
                falloff_factor: cli.falloff_factor,
                use_proximity: cli.proximity,
                use_panning: cli.panning,
                dead_voice: cli.voice_when_dead,
                dead_non_proximity: cli.dead_non_proximity,
                map_scale: cli.map_scale,
                use_tts: cli.tts,
                show_chat: cli.show_chat,
                chat_tts: cli.chat_tts,
                others_on_minimap: cli.others_on_minimap,
                teammates_on_minimap: cli.teammates_on_minimap,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_into_config() {
        let cli = Cli::try_parse_from(["earshot-bridge"]).expect("defaults parse");
        let config = BridgeConfig::try_from(cli).expect("defaults convert");

        assert_eq!(config.listen_addr.port(), 8060);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert!(config.net.use_proximity);
        assert!(!config.net.dead_voice);
    }

    #[test]
    fn max_distance_converts_studs_to_world_units() {
        let cli = Cli::try_parse_from(["earshot-bridge", "--max-distance", "80"])
            .expect("flag parses");
        let config = BridgeConfig::try_from(cli).expect("converts");
        assert_eq!(config.net.max_voice_distance, 800.0);
    }

    #[test]
    fn boolean_flags_take_explicit_values() {
        let cli = Cli::try_parse_from([
            "earshot-bridge",
            "--proximity",
            "false",
            "--chat-tts",
            "true",
        ])
        .expect("flags parse");
        let config = BridgeConfig::try_from(cli).expect("converts");
        assert!(!config.net.use_proximity);
        assert!(config.net.chat_tts);
    }

    #[test]
    fn invalid_listen_address_is_rejected() {
        let cli = Cli::try_parse_from(["earshot-bridge", "--listen-addr", "not-an-addr"])
            .expect("string parses as an argument");
        assert!(BridgeConfig::try_from(cli).is_err());
    }
}
