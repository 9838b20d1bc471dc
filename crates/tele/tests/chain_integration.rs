//! Chain behaviour against an in-memory carrier: redials, stale attempts, and the ways
//! a chain dies.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tele::carrier::Carrier;
use tele::carrier::Link;
use tele::carrier::sieve::Sieve;
use tele::chain;
use tele::chain::ChainConn;
use tele::chain::ChainId;
use tele::chain::Delivery;
use tele::chain::RejectCode;
use tele::chain::SequentialIds;
use tele::chain::Stitch;
use tele::chain::handshake;
use tokio::time::timeout;

use common::WAIT;
use common::fast_config;
use common::init_tracing;
use common::sieve_carrier;

async fn next_stitch(conn: &mut ChainConn) -> anyhow::Result<Stitch> {
    match timeout(WAIT, conn.read()).await?? {
        Delivery::Stitch(stitch) => Ok(stitch),
        Delivery::Chunk(chunk) => anyhow::bail!("expected a stitch, got chunk {:?}", chunk),
    }
}

async fn next_chunk(conn: &mut ChainConn) -> anyhow::Result<Vec<u8>> {
    match timeout(WAIT, conn.read()).await?? {
        Delivery::Chunk(chunk) => Ok(chunk),
        Delivery::Stitch(stitch) => anyhow::bail!("expected a chunk, got stitch {}", stitch.seq),
    }
}

/// Performs a dial handshake by hand and returns the link with the accepter's verdict.
async fn handshake_by_hand(sieve: &Sieve, addr: &str, id: u64, seq: u64) -> anyhow::Result<(Link, RejectCode)> {
    let mut link = sieve.dial(addr).await?;
    link.tx.send(&handshake::encode_dial(id, seq)).await?;
    let welcome = timeout(WAIT, link.rx.recv())
        .await??
        .ok_or_else(|| anyhow::anyhow!("closed before welcome"))?;
    let code = handshake::decode_welcome(&welcome).ok_or_else(|| anyhow::anyhow!("bad welcome {:?}", welcome))?;
    Ok((link, code))
}

#[tokio::test]
async fn test_chain_reconnects_after_cuts() -> anyhow::Result<()> {
    init_tracing();
    let sieve = Sieve::new();
    let carrier = sieve_carrier(&sieve);
    let mut listener = chain::Listener::bind(carrier.clone(), "chain", fast_config()).await?;
    let dialer = chain::Dialer::new(carrier, fast_config(), Arc::new(SequentialIds::new(1)))?;

    let mut client = dialer.dial("chain");
    let mut server = timeout(WAIT, listener.accept()).await??;
    assert_eq!(client.id(), server.id());

    let mut client_writer = next_stitch(&mut client).await?.writer;
    let server_stitch = next_stitch(&mut server).await?;
    assert_eq!(server_stitch.seq, 1);
    client_writer.write(b"first").await?;
    assert_eq!(next_chunk(&mut server).await?, b"first".to_vec());

    for expected in 2..=4 {
        sieve.cut_all();
        let stitch = next_stitch(&mut client).await?;
        assert_eq!(stitch.seq, expected);
        // The old writer is bound to a dead link forever.
        assert_eq!(client_writer.write(b"stale").await, Err(chain::Error::Superseded));
        client_writer = stitch.writer;

        let stitch = next_stitch(&mut server).await?;
        assert_eq!(stitch.seq, expected);
        client_writer.write(&[expected as u8]).await?;
        assert_eq!(next_chunk(&mut server).await?, vec![expected as u8]);
    }
    Ok(())
}

#[tokio::test]
async fn test_unreachable_redials_do_not_consume_attempts() -> anyhow::Result<()> {
    init_tracing();
    let sieve = Sieve::new();
    let carrier = sieve_carrier(&sieve);
    let mut listener = chain::Listener::bind(carrier.clone(), "flaky", fast_config()).await?;
    let dialer = chain::Dialer::new(carrier, fast_config(), Arc::new(SequentialIds::new(1)))?;

    let mut client = dialer.dial("flaky");
    let mut server = timeout(WAIT, listener.accept()).await??;
    next_stitch(&mut client).await?;
    next_stitch(&mut server).await?;

    sieve.set_down("flaky", true);
    sieve.cut_all();
    let before = sieve.dials();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sieve.dials() > before + 1, "dialer should keep retrying");
    sieve.set_down("flaky", false);

    assert_eq!(next_stitch(&mut client).await?.seq, 2);
    assert_eq!(next_stitch(&mut server).await?.seq, 2);
    Ok(())
}

#[tokio::test]
async fn test_accepter_judges_attempt_numbers() -> anyhow::Result<()> {
    init_tracing();
    let sieve = Sieve::new();
    let carrier = sieve_carrier(&sieve);
    let mut listener = chain::Listener::bind(carrier, "judge", fast_config()).await?;

    let (mut first, code) = handshake_by_hand(&sieve, "judge", 7, 1).await?;
    assert_eq!(code, RejectCode::Ok);
    let mut server = timeout(WAIT, listener.accept()).await??;
    assert_eq!(server.id(), ChainId(7));
    assert_eq!(next_stitch(&mut server).await?.seq, 1);
    first.tx.send(b"over one").await?;
    assert_eq!(next_chunk(&mut server).await?, b"over one".to_vec());

    // Attempt numbers may skip, but never go backwards or repeat.
    let (mut third, code) = handshake_by_hand(&sieve, "judge", 7, 3).await?;
    assert_eq!(code, RejectCode::Ok);
    assert_eq!(next_stitch(&mut server).await?.seq, 3);
    assert_eq!(handshake_by_hand(&sieve, "judge", 7, 2).await?.1, RejectCode::Duplicate);
    assert_eq!(handshake_by_hand(&sieve, "judge", 7, 3).await?.1, RejectCode::Duplicate);

    // The replaced link is retired: what it carries is never delivered.
    let _ = first.tx.send(b"from the past").await;
    third.tx.send(b"over three").await?;
    assert_eq!(next_chunk(&mut server).await?, b"over three".to_vec());

    assert_eq!(handshake_by_hand(&sieve, "judge", 8, 2).await?.1, RejectCode::ClosedChain);
    assert_eq!(handshake_by_hand(&sieve, "judge", 9, 0).await?.1, RejectCode::ZeroSeq);

    let mut garbage = sieve.dial("judge").await?;
    garbage.tx.send(&[0x80]).await?;
    let welcome = timeout(WAIT, garbage.rx.recv()).await??;
    assert_eq!(welcome.as_deref().and_then(handshake::decode_welcome), Some(RejectCode::Malformed));
    Ok(())
}

#[tokio::test]
async fn test_killed_chain_rejects_redials() -> anyhow::Result<()> {
    init_tracing();
    let sieve = Sieve::new();
    let carrier = sieve_carrier(&sieve);
    let mut listener = chain::Listener::bind(carrier, "dead", fast_config()).await?;

    let (_link, code) = handshake_by_hand(&sieve, "dead", 11, 1).await?;
    assert_eq!(code, RejectCode::Ok);
    let server = timeout(WAIT, listener.accept()).await??;
    let handle = server.handle();
    drop(server);
    assert_eq!(timeout(WAIT, handle.killed()).await?, chain::Error::Killed);

    // Once unregistered the id is unknown, and only attempt 1 could open it again.
    let code = handshake_by_hand(&sieve, "dead", 11, 2).await?.1;
    assert_eq!(code, RejectCode::ClosedChain);
    Ok(())
}

#[tokio::test]
async fn test_permanently_gone_remote_kills_the_dialer() -> anyhow::Result<()> {
    init_tracing();
    let sieve = Sieve::new();
    let carrier = sieve_carrier(&sieve);
    let mut listener = chain::Listener::bind(carrier.clone(), "gone", fast_config()).await?;
    let dialer = chain::Dialer::new(carrier, fast_config(), Arc::new(SequentialIds::new(1)))?;

    let mut client = dialer.dial("gone");
    let _server = timeout(WAIT, listener.accept()).await??;
    next_stitch(&mut client).await?;

    sieve.kill("gone");
    let err = timeout(WAIT, client.read()).await?.unwrap_err();
    assert_eq!(err, chain::Error::Gone("gone".into()));
    assert!(client.handle().is_killed());
    Ok(())
}

#[tokio::test]
async fn test_orphaned_chain_dies_on_the_accept_side() -> anyhow::Result<()> {
    init_tracing();
    let sieve = Sieve::new();
    let carrier = sieve_carrier(&sieve);
    let config = fast_config().with_orphan_timeout(Some(Duration::from_millis(100)));
    let mut listener = chain::Listener::bind(carrier.clone(), "orphan", config.clone()).await?;
    let dialer = chain::Dialer::new(carrier, config, Arc::new(SequentialIds::new(1)))?;

    let client = dialer.dial("orphan");
    let mut server = timeout(WAIT, listener.accept()).await??;
    next_stitch(&mut server).await?;

    client.kill();
    sieve.cut_all();
    let err = timeout(WAIT, server.read()).await?.unwrap_err();
    assert_eq!(err, chain::Error::Orphaned);
    Ok(())
}

#[tokio::test]
async fn test_dial_before_listen_waits_for_the_listener() -> anyhow::Result<()> {
    init_tracing();
    let sieve = Sieve::new();
    let carrier = sieve_carrier(&sieve);
    let dialer = chain::Dialer::new(carrier.clone(), fast_config(), Arc::new(SequentialIds::new(1)))?;

    let mut client = dialer.dial("late");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut listener = chain::Listener::bind(carrier, "late", fast_config()).await?;
    let mut server = timeout(WAIT, listener.accept()).await??;

    assert_eq!(next_stitch(&mut client).await?.seq, 1);
    assert_eq!(next_stitch(&mut server).await?.seq, 1);
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_refused() -> anyhow::Result<()> {
    let sieve = Sieve::new();
    let config = fast_config().with_buffer_capacity(2).with_ack_frequency(3);

    let err = chain::Dialer::new(sieve_carrier(&sieve), config.clone(), Arc::new(SequentialIds::new(1))).err();
    assert!(matches!(err, Some(chain::Error::Config(ref e)) if e.field == "ack_frequency"));
    let err = chain::Listener::bind(sieve_carrier(&sieve), "invalid", config).await.err();
    assert!(matches!(err, Some(chain::Error::Config(_))));
    Ok(())
}
