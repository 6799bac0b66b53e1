// Copyright 2023 Gantry Authors
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use net::TlsTcpAcceptor;
use std::io::{Error, ErrorKind};

/// The TLS settings a listener may carry. Backed by the `[tls]` config
/// section and by persisted listener definitions.
pub trait TlsConfig {
    fn certificate_chain(&self) -> Option<String>;

    fn private_key(&self) -> Option<String>;

    fn certificate(&self) -> Option<String>;

    fn ca_file(&self) -> Option<String>;
}

/// Build a TLS acceptor from the settings, or `None` when TLS is not
/// configured at all. A private key without a certificate (or the other
/// way around) is a configuration error, reported distinctly so the
/// operator knows which half is missing.
pub fn tls_acceptor(config: &dyn TlsConfig) -> Result<Option<TlsTcpAcceptor>, Error> {
    let certificate = config.certificate();
    let chain = config.certificate_chain();
    let has_certificate = certificate.is_some() || chain.is_some();

    let private_key = match (config.private_key(), has_certificate) {
        (None, false) => return Ok(None),
        (Some(key), true) => key,
        (None, true) => {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "tls certificate configured without a private key",
            ));
        }
        (Some(_), false) => {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "tls private key configured without a certificate",
            ));
        }
    };

    let mut builder = TlsTcpAcceptor::mozilla_intermediate_v5()?.private_key_file(private_key);

    if let Some(file) = config.ca_file() {
        builder = builder.ca_file(file);
    }
    if let Some(file) = certificate {
        builder = builder.certificate_file(file);
    }
    if let Some(file) = chain {
        builder = builder.certificate_chain_file(file);
    }

    builder.build().map(Some)
}
