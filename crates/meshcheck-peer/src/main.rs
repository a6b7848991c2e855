use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use clap::Parser;
use ed25519_dalek::SigningKey;
use meshcheck_core::{logging, HarnessConfig};
use meshcheck_events::{initial_room_events, RoomVersion};
use meshcheck_federation::FederationPeer;

mod cli;

fn read_signing_key(path: &Path) -> Result<SigningKey> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read signing key {}", path.display()))?;
    let seed = STANDARD_NO_PAD
        .decode(contents.trim().trim_end_matches('='))
        .context("signing key is not valid base64")?;
    let seed: [u8; 32] = seed
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow::anyhow!("signing key seed is {} bytes, expected 32", bytes.len()))?;
    Ok(SigningKey::from_bytes(&seed))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let config = HarnessConfig::load(Some(&args.config))?;
    logging::init(&config.log);

    let mut builder = FederationPeer::builder(&config)
        .handle_key_requests()
        .handle_directory_lookups()
        .handle_make_send_join_requests()
        .handle_make_send_knock_requests()
        .handle_invite_requests(|invite| {
            tracing::info!(room_id = invite.room_id(), sender = invite.sender(), "invite accepted");
        })
        .handle_transaction_requests()
        .handle_event_requests()
        .handle_missing_events_requests()
        .on_pdu(|pdu| {
            tracing::info!(event_id = pdu.event_id(), event_type = pdu.event_type(), "pdu received");
        });
    if args.lenient {
        builder = builder.unexpected_requests_are_errors(false);
    }
    if let Some(path) = &args.signing_key {
        builder = builder.signing_key(read_signing_key(path)?);
    }
    let mut peer = builder.build()?;

    if let Some(version_id) = &args.room_version {
        let version = RoomVersion::parse(version_id)?;
        let creator = peer.user_id("host");
        let room = peer.make_room(version_id, &initial_room_events(version, &creator))?;
        let alias = peer.alias(room.room_id(), "test");
        tracing::info!(room_id = room.room_id(), %alias, version = version.id, "room ready");
    }

    let guard = peer.listen()?;
    tracing::info!(
        server_name = peer.server_name(),
        url = %peer.base_url(),
        "federation peer running, press ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    guard.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn signing_key_round_trips_through_file() -> Result<()> {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "{}", STANDARD_NO_PAD.encode(key.to_bytes()))?;
        assert_eq!(read_signing_key(file.path())?.to_bytes(), key.to_bytes());
        Ok(())
    }

    #[test]
    fn short_seed_is_rejected() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{}", STANDARD_NO_PAD.encode([1u8; 16]))?;
        let err = read_signing_key(file.path()).unwrap_err();
        assert!(err.to_string().contains("16 bytes"), "{err}");
        Ok(())
    }

    #[test]
    fn args_parse_flags() {
        let args = cli::Args::parse_from(["meshcheck-peer", "--lenient", "--room-version", "10"]);
        assert!(args.lenient);
        assert_eq!(args.room_version.as_deref(), Some("10"));
        assert_eq!(args.config, std::path::PathBuf::from("config/meshcheck.toml"));
    }
}
