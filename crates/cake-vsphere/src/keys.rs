//! SSH key pair generation for the RKE bootstrap node.

use std::time::Duration;

use tracing::debug;

use cake_common::command::{CommandRunner, Invocation};
use cake_common::Result;

const KEYGEN_TIMEOUT: Duration = Duration::from_secs(60);

/// A PEM private key and its authorized_keys line
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// PEM encoded RSA private key
    pub private_key: String,
    /// `ssh-rsa ...` line
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Generate a 4096-bit RSA key pair with `ssh-keygen`
pub async fn generate_key_pair(runner: &dyn CommandRunner) -> Result<KeyPair> {
    let dir = tempfile::tempdir()?;
    let key_path = dir.path().join("id_rsa");

    runner
        .run(
            &Invocation::new("ssh-keygen")
                .args(["-q", "-t", "rsa", "-b", "4096", "-m", "PEM", "-N", "", "-C", "cake", "-f"])
                .arg(key_path.display().to_string())
                .timeout(KEYGEN_TIMEOUT),
        )
        .await?;

    let private_key = tokio::fs::read_to_string(&key_path).await?;
    let public_key = tokio::fs::read_to_string(key_path.with_extension("pub")).await?;
    debug!("generated ssh key pair");
    Ok(KeyPair {
        private_key: private_key.trim().to_string(),
        public_key: public_key.trim().to_string(),
    })
}
