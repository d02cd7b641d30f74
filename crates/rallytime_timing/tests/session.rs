use anyhow::Result;
use rallytime_timing::{DecoderConfig, DecoderSession, Key};
use std::time::Duration;

async fn type_keys(session: &DecoderSession, text: &str, gap: Duration) {
    for ch in text.chars() {
        assert!(session.press(Key::Char(ch)).await);
        tokio::time::sleep(gap).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_session_decodes_fast_burst() -> Result<()> {
    let mut session = DecoderSession::spawn(DecoderConfig::default())?;

    type_keys(&session, "E200341201", Duration::from_millis(10)).await;
    session.press(Key::Enter).await;

    let tag = session.next_tag().await.expect("tag");
    assert_eq!(tag.value, "E200341201");
    assert!(tag.burst <= Duration::from_millis(100));

    session.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_session_idle_timer_discards_capture() -> Result<()> {
    let mut session = DecoderSession::spawn(DecoderConfig::default())?;

    type_keys(&session, "A1", Duration::from_millis(10)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    type_keys(&session, "B2C3D", Duration::from_millis(10)).await;
    session.press(Key::Enter).await;

    let tag = session.next_tag().await.expect("tag");
    assert_eq!(tag.value, "B2C3D");

    session.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_session_rejects_human_typing() -> Result<()> {
    let mut session = DecoderSession::spawn(DecoderConfig::default())?;

    type_keys(&session, "HELLO", Duration::from_millis(200)).await;
    session.press(Key::Enter).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(session.try_next_tag().is_none());
    session.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_key_sender_feeds_same_decoder() -> Result<()> {
    let mut session = DecoderSession::spawn(DecoderConfig::default())?;
    let sender = session.key_sender();

    let reader = tokio::spawn(async move {
        for ch in "ZX9Y8".chars() {
            let at = tokio::time::Instant::now().into_std();
            sender
                .send(rallytime_timing::KeyEvent::new(Key::Char(ch), at))
                .await
                .ok();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let at = tokio::time::Instant::now().into_std();
        sender
            .send(rallytime_timing::KeyEvent::new(Key::Tab, at))
            .await
            .ok();
    });

    let tag = session.next_tag().await.expect("tag");
    assert_eq!(tag.value, "ZX9Y8");
    reader.await?;
    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = DecoderConfig {
        terminators: Vec::new(),
        ..DecoderConfig::default()
    };
    assert!(DecoderSession::spawn(config).is_err());
}
