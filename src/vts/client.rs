// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client side of the channel handshake.

use std::time::Duration;

use tracing::debug;

use crate::{
    codec::hsvalue::{HsReader, HsValue, HsWriter},
    crypto::{
        block::{CipherAlgo, CipherMode},
        hashes::HashKind,
    },
    error::{Error, Result},
    vts::{
        bridge::{
            HsStep, Vts, approve_peer_key, cp_do_produce, drain_ciphertext,
            enable_plaintext, parse_id_or_certs, pp_do_produce, random_bytes,
            run_authorization,
        },
        handshake::{
            ClientHello, Credentials, MIN_RAND_LEN, PubKeyData, ServerHello,
            asymm_dec_value, asymm_enc_value, blockcipher_enc_value, sendkey_seed,
        },
    },
};

fn sched_cp_produce(vts: &Vts) {
    let reactor = vts.borrow().reactor.clone();
    let vts = vts.clone();
    let _ = reactor.schedule(Duration::ZERO, move || cp_do_produce(&vts));
}

/// Protocol hello confirmed; queue the ClientHello.
pub(crate) fn init_handshake(vts: &Vts) -> Result<()> {
    {
        let mut st = vts.borrow_mut();
        st.rand_c = random_bytes(MIN_RAND_LEN);
        let hello = ClientHello {
            hmac_hashes: st
                .config
                .hmac_hashes
                .iter()
                .map(ToString::to_string)
                .collect(),
            ciphers: st
                .config
                .ciphers
                .iter()
                .map(|(algo, modes)| {
                    (
                        algo.to_string(),
                        modes.iter().map(ToString::to_string).collect(),
                    )
                })
                .collect(),
            hashes: st.config.hashes.iter().map(ToString::to_string).collect(),
            rand: st.rand_c.clone(),
            max_keylen: st.config.max_keylen.map(|v| v as u64),
            hshake_lim: st.config.hshake_lim,
        };
        st.hs_writer = Some(HsWriter::new(&hello.to_value()));
        st.hs_reader =
            Some(HsReader::new(st.config.hshake_lim.map(|v| v as usize)));
        st.hs_step = Some(HsStep::AwaitServerHello);
    }
    sched_cp_produce(vts);
    Ok(())
}

/// Handles ServerHello and queues ClientKeyX.
pub(crate) fn on_server_hello(vts: &Vts, msg: HsValue) -> Result<()> {
    let sh = ServerHello::from_value(&msg)?;

    let server_key = {
        let mut st = vts.borrow_mut();
        let hmac: HashKind = sh
            .hmac_name
            .parse()
            .ok()
            .filter(|h| st.config.hmac_hashes.contains(h))
            .ok_or_else(|| Error::protocol("invalid HMAC hash method name"))?;
        let algo: CipherAlgo = sh
            .cipher_name
            .parse()
            .ok()
            .ok_or_else(|| Error::protocol("invalid cipher name or mode"))?;
        let mode: CipherMode = sh
            .cipher_mode
            .parse()
            .ok()
            .ok_or_else(|| Error::protocol("invalid cipher name or mode"))?;
        let offered = st
            .config
            .ciphers
            .iter()
            .any(|(a, modes)| *a == algo && modes.contains(&mode));
        if !offered {
            return Err(Error::protocol("invalid cipher name or mode"));
        }
        let hash: HashKind = sh
            .hash_name
            .parse()
            .ok()
            .filter(|h| st.config.hashes.contains(h))
            .ok_or_else(|| Error::protocol("invalid hash name"))?;

        st.hmac_kind = Some(hmac);
        st.cipher = Some((algo, mode));
        st.hash_kind = Some(hash);
        st.rand_s = sh.rand.clone();
        st.peer_max_keylen = sh.max_keylen;
        st.peer_hshake_lim = sh.hshake_lim;

        if !st.config.pub_ciphers.contains(&sh.keydata.cipher_name) {
            return Err(Error::protocol("not a supported public key cipher"));
        }
        let key = sh.keydata.clone().into_key()?;
        if let Some(max) = st.config.max_keylen
            && key.exceeds_len(max)
        {
            return Err(Error::protocol("peer public key exceeds max length"));
        }
        st.peer_pub_key = Some(key.clone());
        key
    };

    approve_peer_key(vts, &server_key)?;

    let (identity, chain) =
        parse_id_or_certs(vts, Some(&server_key), sh.credentials.clone())?;
    {
        let mut st = vts.borrow_mut();
        st.peer_identity = identity;
        st.peer_certificates = chain;
    }
    run_authorization(vts)?;

    // Compose the key exchange message.
    {
        let mut st = vts.borrow_mut();
        st.srand_c = random_bytes(MIN_RAND_LEN);
        let (hmac, cipher, hash) = st.negotiated()?;

        let keydata_value = match &st.keypair {
            Some(keypair) => PubKeyData::from_key(&keypair.public()?)?.to_value(),
            None => HsValue::Null,
        };
        let creds_value = Credentials::to_value(&st.own_credentials()?);
        // Length randomization slot; kept empty.
        let padding = Vec::new();
        let msg_value =
            HsValue::Tuple(vec![keydata_value, creds_value, HsValue::Bytes(padding)]);

        let block_rand = random_bytes(MIN_RAND_LEN);
        let keyseed = sendkey_seed(&block_rand, &st.srand_c);
        let enc_msg = blockcipher_enc_value(
            &msg_value,
            &keyseed,
            hmac,
            cipher,
            hash,
            st.config.padding,
        )?;
        let msg_hash = hash.digest(&msg_value.encode());
        let header = HsValue::Tuple(vec![
            HsValue::bytes(st.srand_c.clone()),
            HsValue::bytes(block_rand),
            HsValue::bytes(msg_hash),
        ]);
        let enc_header =
            asymm_enc_value(&header, &server_key, hash, st.config.padding)?;
        let send = HsValue::Tuple(vec![
            HsValue::bytes(enc_header),
            HsValue::bytes(enc_msg),
        ]);
        st.hs_writer = Some(HsWriter::new(&send));

        if st.keypair.is_some() {
            st.hs_step = Some(HsStep::AwaitServerFinished);
            st.hs_reader =
                Some(HsReader::new(st.config.hshake_lim.map(|v| v as usize)));
        } else {
            // Anonymous fast path: three-part keyseeds, no server
            // finished message.
            st.install_encrypters(false)?;
            st.end_handshaking = true;
            st.hs_step = None;
        }
    }
    sched_cp_produce(vts);
    Ok(())
}

/// Handles the server secret and switches to running state.
pub(crate) fn on_server_finished(vts: &Vts, msg: HsValue) -> Result<()> {
    let data = msg
        .as_bytes()
        .ok_or_else(|| Error::protocol("invalid received data package"))?;
    let (keypair, hash) = {
        let st = vts.borrow();
        let keypair = st
            .keypair
            .clone()
            .ok_or_else(|| Error::protocol("unexpected server finished message"))?;
        (keypair, st.negotiated()?.2)
    };
    let decoded = asymm_dec_value(data, &keypair, hash)
        .map_err(|_| Error::protocol("could not decrypt server secret"))?;
    let srand_s = decoded
        .as_bytes()
        .ok_or_else(|| Error::protocol("illegal data types"))?
        .to_vec();
    if srand_s.len() < MIN_RAND_LEN {
        return Err(Error::protocol("minimum 32 bytes random data required"));
    }

    {
        let mut st = vts.borrow_mut();
        st.srand_s = srand_s;
        st.install_encrypters(true)?;
        st.handshaking = false;
        st.hs_step = None;
    }
    debug!("client handshake completed");
    enable_plaintext(vts);
    // Frames may already be buffered behind the final message.
    drain_ciphertext(vts)?;
    pp_do_produce(vts);
    sched_cp_produce(vts);
    Ok(())
}
