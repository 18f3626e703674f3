// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SHA-256 file digesting, shared by the APK parser, the delta engine, and
//! (via the CLI's `validate-repo` walker) anyone cross-checking a release's
//! recorded digest against the bytes actually on disk.

use crate::error::Result;
use crate::types::{Sha256Base64, Sha256Hex};
use sha2::{Digest, Sha256};
use std::path::Path;

pub fn sha256_base64_of_file(path: &Path) -> Result<Sha256Base64> {
    Ok(Sha256Base64::from_digest_bytes(&digest(path)?))
}

pub fn sha256_hex_of_file(path: &Path) -> Result<Sha256Hex> {
    Ok(Sha256Hex::from_digest_bytes(&digest(path)?))
}

fn digest(path: &Path) -> Result<[u8; 32]> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}
