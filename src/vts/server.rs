// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server side of the channel handshake.

use std::time::Duration;

use tracing::debug;

use crate::{
    codec::hsvalue::{HsReader, HsValue, HsWriter},
    error::{Error, Result},
    vts::{
        bridge::{
            HsStep, Vts, approve_peer_key, cp_do_produce, drain_ciphertext,
            parse_id_or_certs, pp_do_produce, random_bytes, run_authorization,
        },
        handshake::{
            ClientHello, Credentials, MIN_RAND_LEN, PubKeyData, ServerHello,
            asymm_dec_value, asymm_enc_value, blockcipher_dec_value, sendkey_seed,
        },
    },
};

fn sched_cp_produce(vts: &Vts) {
    let reactor = vts.borrow().reactor.clone();
    let vts = vts.clone();
    let _ = reactor.schedule(Duration::ZERO, move || cp_do_produce(&vts));
}

/// Protocol hello confirmed; wait for the ClientHello.
pub(crate) fn init_handshake(vts: &Vts) -> Result<()> {
    let mut st = vts.borrow_mut();
    st.hs_reader = Some(HsReader::new(st.config.hshake_lim.map(|v| v as usize)));
    st.hs_step = Some(HsStep::AwaitClientHello);
    Ok(())
}

/// Negotiates parameters by first match in own preference order and
/// queues the ServerHello.
pub(crate) fn on_client_hello(vts: &Vts, msg: HsValue) -> Result<()> {
    let ch = ClientHello::from_value(&msg)?;

    {
        let mut st = vts.borrow_mut();
        st.rand_c = ch.rand.clone();
        st.peer_max_keylen = ch.max_keylen;
        st.peer_hshake_lim = ch.hshake_lim;

        let hmac = st
            .config
            .hmac_hashes
            .iter()
            .find(|h| ch.hmac_hashes.contains(&h.to_string()))
            .copied()
            .ok_or_else(|| Error::protocol("could not negotiate HMAC hash method"))?;

        let mut selected = None;
        for (algo, modes) in &st.config.ciphers {
            let Some((_, peer_modes)) = ch
                .ciphers
                .iter()
                .find(|(name, _)| *name == algo.to_string())
            else {
                continue;
            };
            if let Some(mode) =
                modes.iter().find(|m| peer_modes.contains(&m.to_string()))
            {
                selected = Some((*algo, *mode));
                break;
            }
        }
        let cipher = selected
            .ok_or_else(|| Error::protocol("could not negotiate cipher and mode"))?;

        let hash = st
            .config
            .hashes
            .iter()
            .find(|h| ch.hashes.contains(&h.to_string()))
            .copied()
            .ok_or_else(|| {
                Error::protocol("could not negotiate message validation hash")
            })?;

        st.hmac_kind = Some(hmac);
        st.cipher = Some(cipher);
        st.hash_kind = Some(hash);
        st.rand_s = random_bytes(MIN_RAND_LEN);

        let keypair = st
            .keypair
            .as_ref()
            .ok_or_else(|| Error::validation("server channel requires a keypair"))?;
        let keydata = PubKeyData::from_key(&keypair.public()?)?;

        let hello = ServerHello {
            hmac_name: hmac.to_string(),
            cipher_name: cipher.0.to_string(),
            cipher_mode: cipher.1.to_string(),
            hash_name: hash.to_string(),
            rand: st.rand_s.clone(),
            keydata,
            credentials: st.own_credentials()?,
            max_keylen: st.config.max_keylen.map(|v| v as u64),
            hshake_lim: st.config.hshake_lim,
        };
        st.hs_writer = Some(HsWriter::new(&hello.to_value()));
        st.hs_reader =
            Some(HsReader::new(st.config.hshake_lim.map(|v| v as usize)));
        st.hs_step = Some(HsStep::AwaitClientKeyX);
    }
    sched_cp_produce(vts);
    Ok(())
}

/// Decrypts ClientKeyX, authorizes the client, and finishes (directly
/// on the anonymous path, or by sending the server secret).
pub(crate) fn on_client_keyx(vts: &Vts, msg: HsValue) -> Result<()> {
    let parts = msg
        .as_tuple()
        .filter(|t| t.len() == 2)
        .ok_or_else(|| Error::protocol("invalid received data package"))?;
    let enc_header = parts[0]
        .as_bytes()
        .ok_or_else(|| Error::protocol("invalid received data package"))?;
    let enc_msg = parts[1]
        .as_bytes()
        .ok_or_else(|| Error::protocol("invalid received data package"))?;

    let (keypair, hmac, cipher, hash, padding) = {
        let st = vts.borrow();
        let keypair = st
            .keypair
            .clone()
            .ok_or_else(|| Error::validation("server channel requires a keypair"))?;
        let (hmac, cipher, hash) = st.negotiated()?;
        (keypair, hmac, cipher, hash, st.config.padding)
    };

    // Header carries the client secret, the body keyseed and the body
    // hash, protected by our public key.
    let header = asymm_dec_value(enc_header, &keypair, hash)
        .map_err(|_| Error::protocol("could not decrypt key exchange header"))?;
    let header = header
        .as_tuple()
        .filter(|t| t.len() == 3)
        .ok_or_else(|| Error::protocol("invalid header"))?;
    let field = |i: usize| -> Result<Vec<u8>> {
        header[i]
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::protocol("invalid header"))
    };
    let srand_c = field(0)?;
    let block_rand = field(1)?;
    let msg_hash = field(2)?;
    if srand_c.len() < MIN_RAND_LEN || block_rand.len() < MIN_RAND_LEN {
        return Err(Error::protocol("minimum 32 bytes random data required"));
    }

    let keyseed = sendkey_seed(&block_rand, &srand_c);
    let body = blockcipher_dec_value(enc_msg, &keyseed, hmac, cipher, hash)
        .map_err(|_| Error::protocol("could not decrypt key exchange body"))?;
    if hash.digest(&body.encode()) != msg_hash {
        return Err(Error::protocol("header and content hash value mismatch"));
    }
    let body = body
        .as_tuple()
        .filter(|t| t.len() == 3)
        .ok_or_else(|| Error::protocol("invalid content"))?;

    {
        let mut st = vts.borrow_mut();
        st.srand_c = srand_c;
    }

    // Reconstruct the client public key, when one was sent.
    let client_key = if body[0].is_null() {
        None
    } else {
        let keydata = PubKeyData::from_value(&body[0])?;
        {
            let st = vts.borrow();
            if !st.config.pub_ciphers.contains(&keydata.cipher_name) {
                return Err(Error::protocol("not a supported public key cipher"));
            }
        }
        let key = keydata.into_key()?;
        let max_keylen = vts.borrow().config.max_keylen;
        if let Some(max) = max_keylen
            && key.exceeds_len(max)
        {
            return Err(Error::protocol("peer public key exceeds max length"));
        }
        approve_peer_key(vts, &key)?;
        Some(key)
    };

    let credentials = Credentials::from_value(&body[1])?;
    if client_key.is_none() && credentials.is_some() {
        return Err(Error::protocol("client sent credentials without a key"));
    }

    let (identity, chain) =
        parse_id_or_certs(vts, client_key.as_ref(), credentials)?;
    {
        let mut st = vts.borrow_mut();
        st.peer_pub_key = client_key.clone();
        st.peer_identity = identity;
        st.peer_certificates = chain;
    }
    run_authorization(vts)?;

    {
        let mut st = vts.borrow_mut();
        match &client_key {
            Some(key) => {
                // Client presented a key: prove our identity by
                // returning a fresh secret under it.
                st.srand_s = random_bytes(MIN_RAND_LEN);
                let finished = asymm_enc_value(
                    &HsValue::bytes(st.srand_s.clone()),
                    key,
                    hash,
                    padding,
                )?;
                st.hs_writer = Some(HsWriter::new(&HsValue::bytes(finished)));
                st.install_encrypters(true)?;
                st.end_handshaking = true;
            },
            None => {
                st.install_encrypters(false)?;
                st.handshaking = false;
                debug!("server handshake completed");
            },
        }
        st.hs_step = None;
    }
    let running = !vts.borrow().handshaking;
    if running {
        // Anonymous path: client frames may trail the key exchange.
        drain_ciphertext(vts)?;
        pp_do_produce(vts);
    }
    sched_cp_produce(vts);
    Ok(())
}
