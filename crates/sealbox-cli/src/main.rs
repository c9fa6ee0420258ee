use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sealbox_core::stores::{has_metadata_key, BinaryStore, DotenvStore, JsonStore, Store, YamlStore};
use sealbox_core::{
    decrypt_tree, encrypt_tree, AgeMasterKey, AzureKeyVaultMasterKey, Cipher, GcpKmsMasterKey,
    KeyGroup, KmsMasterKey, MasterKey, Metadata, PgpMasterKey, SelectionPolicy, Tree,
    VaultTransitMasterKey,
};

#[derive(Parser)]
#[command(name = "sealbox", version, about = "Encrypts and decrypts structured configuration documents at the value level")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encrypt a cleartext document.
    Encrypt {
        #[command(flatten)]
        io: IoArgs,
        #[command(flatten)]
        keys: KeyFlags,
        /// Number of key groups that must contribute a share to
        /// recover the data key (0 disables secret sharing).
        #[arg(long, default_value_t = 0)]
        shamir_threshold: usize,
        /// Leaves whose key ends with this suffix stay cleartext.
        #[arg(long)]
        unencrypted_suffix: Option<String>,
        /// Only leaves whose key ends with this suffix are encrypted.
        #[arg(long)]
        encrypted_suffix: Option<String>,
        /// Leaves under a path component matching this regex stay cleartext.
        #[arg(long)]
        unencrypted_regex: Option<String>,
        /// Only leaves under a path component matching this regex are encrypted.
        #[arg(long)]
        encrypted_regex: Option<String>,
        /// Compute the MAC only over leaves selected for encryption.
        #[arg(long)]
        mac_only_encrypted: bool,
    },
    /// Decrypt an encrypted document.
    Decrypt {
        #[command(flatten)]
        io: IoArgs,
        /// Degrade MAC verification failure to a warning.
        #[arg(long)]
        ignore_mac: bool,
    },
    /// Re-generate the data key and re-wrap it for every master key.
    Rotate {
        #[command(flatten)]
        io: IoArgs,
    },
}

#[derive(Args)]
struct IoArgs {
    /// The document to operate on.
    file: PathBuf,
    /// Write the result here instead of stdout.
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Overwrite the input file atomically.
    #[arg(long, short = 'i')]
    in_place: bool,
    /// Force the input format: json, yaml, dotenv or binary.
    #[arg(long)]
    input_type: Option<String>,
    /// Emit the result in a different format than the input.
    #[arg(long)]
    output_type: Option<String>,
}

impl IoArgs {
    /// The store the document is read with, selected by extension
    /// unless `--input-type` overrides it.
    fn input_store(&self) -> anyhow::Result<Box<dyn Store>> {
        store_for(&self.input_format())
    }

    /// The store the result is emitted with; `--output-type` overrides,
    /// otherwise the input format is reused.
    fn output_store(&self) -> anyhow::Result<Box<dyn Store>> {
        match &self.output_type {
            Some(kind) => store_for(kind),
            None => store_for(&self.input_format()),
        }
    }

    fn input_format(&self) -> String {
        match &self.input_type {
            Some(kind) => kind.clone(),
            None => self
                .file
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("binary")
                .to_string(),
        }
    }
}

#[derive(Args)]
struct KeyFlags {
    /// age recipients.
    #[arg(long = "age", value_delimiter = ',')]
    age: Vec<String>,
    /// OpenPGP fingerprints.
    #[arg(long = "pgp", value_delimiter = ',')]
    pgp: Vec<String>,
    /// AWS KMS key ARNs.
    #[arg(long = "kms", value_delimiter = ',')]
    kms: Vec<String>,
    /// Vault transit key URIs (https://vault/v1/<engine>/keys/<name>).
    #[arg(long = "vault-transit", value_delimiter = ',')]
    vault_transit: Vec<String>,
    /// Azure Key Vault key URLs (https://<vault>/keys/<name>/<version>).
    #[arg(long = "azure-kv", value_delimiter = ',')]
    azure_kv: Vec<String>,
    /// GCP KMS crypto key resource ids.
    #[arg(long = "gcp-kms", value_delimiter = ',')]
    gcp_kms: Vec<String>,
}

impl KeyFlags {
    fn into_group(self) -> anyhow::Result<KeyGroup> {
        let mut keys = Vec::new();
        for arn in &self.kms {
            keys.push(MasterKey::Kms(KmsMasterKey::new(arn)?));
        }
        for id in &self.gcp_kms {
            keys.push(MasterKey::GcpKms(GcpKmsMasterKey::new(id)?));
        }
        for url in &self.azure_kv {
            keys.push(MasterKey::AzureKeyVault(AzureKeyVaultMasterKey::from_url(url)?));
        }
        for uri in &self.vault_transit {
            keys.push(MasterKey::VaultTransit(VaultTransitMasterKey::from_uri(uri)?));
        }
        for recipient in &self.age {
            keys.push(MasterKey::Age(AgeMasterKey::new(recipient)?));
        }
        for fp in &self.pgp {
            keys.push(MasterKey::Pgp(PgpMasterKey::new(fp)?));
        }
        if keys.is_empty() {
            bail!("no master keys given; pass at least one of --age, --pgp, --kms, --vault-transit, --azure-kv, --gcp-kms");
        }
        Ok(KeyGroup(keys))
    }
}

fn store_for(kind: &str) -> anyhow::Result<Box<dyn Store>> {
    Ok(match kind.to_lowercase().as_str() {
        "json" => Box::new(JsonStore::new()),
        "yaml" | "yml" => Box::new(YamlStore::new()),
        "env" | "dotenv" => Box::new(DotenvStore::new()),
        "binary" | "bin" => Box::new(BinaryStore::new()),
        other => bail!("unknown format {other:?}"),
    })
}

fn selection_policy(
    unencrypted_suffix: Option<String>,
    encrypted_suffix: Option<String>,
    unencrypted_regex: Option<String>,
    encrypted_regex: Option<String>,
) -> anyhow::Result<SelectionPolicy> {
    let mut rules = Vec::new();
    if let Some(s) = unencrypted_suffix {
        rules.push(SelectionPolicy::UnencryptedSuffix(s));
    }
    if let Some(s) = encrypted_suffix {
        rules.push(SelectionPolicy::EncryptedSuffix(s));
    }
    if let Some(p) = unencrypted_regex {
        rules.push(SelectionPolicy::unencrypted_regex(&p)?);
    }
    if let Some(p) = encrypted_regex {
        rules.push(SelectionPolicy::encrypted_regex(&p)?);
    }
    if rules.len() > 1 {
        bail!("at most one of --unencrypted-suffix, --encrypted-suffix, --unencrypted-regex, --encrypted-regex may be given");
    }
    Ok(rules.pop().unwrap_or_default())
}

fn write_result(io: &IoArgs, content: &[u8]) -> anyhow::Result<()> {
    if io.in_place {
        // Write-then-rename keeps a crash from truncating the document.
        let dir = io.file.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, content)?;
        tmp.persist(&io.file)
            .with_context(|| format!("replacing {}", io.file.display()))?;
    } else if let Some(output) = &io.output {
        std::fs::write(output, content)
            .with_context(|| format!("writing {}", output.display()))?;
    } else {
        use std::io::Write as _;
        std::io::stdout().write_all(content)?;
    }
    Ok(())
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    match cli.command {
        Command::Encrypt {
            io,
            keys,
            shamir_threshold,
            unencrypted_suffix,
            encrypted_suffix,
            unencrypted_regex,
            encrypted_regex,
            mac_only_encrypted,
        } => {
            let store = io.input_store()?;
            let content = std::fs::read(&io.file)
                .with_context(|| format!("reading {}", io.file.display()))?;
            let branches = store.load_plain_file(&content)?;
            if branches.iter().any(|b| has_metadata_key(b)) {
                bail!("{} is already encrypted", io.file.display());
            }

            let policy = selection_policy(
                unencrypted_suffix,
                encrypted_suffix,
                unencrypted_regex,
                encrypted_regex,
            )?;
            let mut metadata = Metadata::new(vec![keys.into_group()?], shamir_threshold, policy);
            metadata.mac_only_encrypted = mac_only_encrypted;

            let data_key = metadata.generate_data_key(&cancel).await?;
            let mut tree = Tree { branches, metadata };
            let mut cipher = Cipher::new();
            encrypt_tree(&mut tree, &data_key, &mut cipher)?;
            write_result(&io, &io.output_store()?.emit_encrypted_file(&tree)?)
        }
        Command::Decrypt { io, ignore_mac } => {
            let store = io.input_store()?;
            let content = std::fs::read(&io.file)
                .with_context(|| format!("reading {}", io.file.display()))?;
            let mut tree = store.load_encrypted_file(&content)?;

            let data_key = tree.metadata.data_key(&cancel).await?;
            let mut cipher = Cipher::new();
            decrypt_tree(&mut tree, &data_key, &mut cipher, ignore_mac)?;
            write_result(&io, &io.output_store()?.emit_plain_file(&tree.branches)?)
        }
        Command::Rotate { io } => {
            let store = io.input_store()?;
            let content = std::fs::read(&io.file)
                .with_context(|| format!("reading {}", io.file.display()))?;
            let mut tree = store.load_encrypted_file(&content)?;

            // Decrypt under the old data key, then re-wrap and
            // re-encrypt everything under a fresh one.
            let old_key = tree.metadata.data_key(&cancel).await?;
            let mut cipher = Cipher::new();
            decrypt_tree(&mut tree, &old_key, &mut cipher, false)?;
            drop(old_key);

            for group in tree.metadata.key_groups.iter_mut() {
                for key in group.0.iter_mut() {
                    key.clear_wrapped_data_key();
                }
            }
            let new_key = tree.metadata.generate_data_key(&cancel).await?;
            encrypt_tree(&mut tree, &new_key, &mut cipher)?;
            write_result(&io, &io.output_store()?.emit_encrypted_file(&tree)?)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    run(cli, cancel).await
}
