//! sealup command line: encrypted multipart uploads into a local store

use anyhow::{anyhow, bail, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use sealup_core::UploadConfig;
use sealup_engine::DEFAULT_MIN_PART_SIZE;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;

fn cli() -> Command {
    let bucket = Arg::new("bucket").required(true).help("Bucket name");
    let key = Arg::new("key").required(true).help("Object key");
    let sse_key = Arg::new("sse-key")
        .long("sse-key")
        .value_name("BASE64")
        .help("Customer-provided AES-256 key, base64 encoded");

    Command::new("sealup")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multipart uploads with customer-provided encryption keys")
        .subcommand_required(true)
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("PATH")
                .help("Data directory path")
                .default_value("./data")
                .global(true),
        )
        .subcommand(Command::new("keygen").about("Generate a fresh customer key"))
        .subcommand(
            Command::new("create-bucket")
                .about("Create a bucket")
                .arg(bucket.clone()),
        )
        .subcommand(
            Command::new("upload")
                .about("Upload a file as a multipart object")
                .arg(bucket.clone())
                .arg(key.clone())
                .arg(Arg::new("file").required(true).help("File to upload"))
                .arg(sse_key.clone())
                .arg(
                    Arg::new("generate-key")
                        .long("generate-key")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("sse-key")
                        .help("Encrypt with a freshly generated key and print it"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_name("PATH")
                        .help("JSON upload configuration"),
                )
                .arg(
                    Arg::new("part-size")
                        .long("part-size")
                        .value_name("BYTES")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize)),
                ),
        )
        .subcommand(
            Command::new("get")
                .about("Download and decrypt an object")
                .arg(bucket.clone())
                .arg(key.clone())
                .arg(Arg::new("output").required(true).help("Destination file"))
                .arg(sse_key),
        )
        .subcommand(
            Command::new("list-uploads")
                .about("List in-progress uploads of a bucket")
                .arg(bucket.clone()),
        )
        .subcommand(
            Command::new("list-parts")
                .about("List the parts of an in-progress upload")
                .arg(bucket.clone())
                .arg(Arg::new("upload-id").required(true)),
        )
        .subcommand(
            Command::new("abort")
                .about("Abort an in-progress upload")
                .arg(bucket)
                .arg(key)
                .arg(Arg::new("upload-id").required(true)),
        )
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("missing argument <{}>", name))
}

fn upload_config(matches: &ArgMatches) -> Result<UploadConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => UploadConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path))?,
        None => UploadConfig::default(),
    }
    .with_env_overrides()?;

    if let Some(part_size) = matches.get_one::<usize>("part-size") {
        config.part_size = *part_size;
    }
    if let Some(concurrency) = matches.get_one::<usize>("concurrency") {
        config.concurrency = *concurrency;
    }
    config.validate()?;

    if (config.part_size as u64) < DEFAULT_MIN_PART_SIZE {
        bail!(
            "part size {} is below the store minimum of {} bytes",
            config.part_size,
            DEFAULT_MIN_PART_SIZE
        );
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let data_dir = PathBuf::from(arg(&matches, "data-dir")?);

    match matches.subcommand() {
        Some(("keygen", _)) => {
            let key = commands::generate_key()?;
            let out = serde_json::json!({
                "sse_key": key.to_base64(),
                "sse_key_md5": key.fingerprint().as_str(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Some(("create-bucket", m)) => {
            let store = commands::open_store(&data_dir)?;
            let bucket = commands::create_bucket(&store, arg(m, "bucket")?)?;
            info!("Bucket {} ready", bucket);
        }
        Some(("upload", m)) => {
            let store = commands::open_store(&data_dir)?;
            let config = upload_config(m)?;
            let sse = if m.get_flag("generate-key") {
                Some(commands::generate_key()?)
            } else {
                commands::parse_key(m.get_one::<String>("sse-key").map(String::as_str))?
            };

            let done = commands::upload(
                &store,
                config,
                arg(m, "bucket")?,
                arg(m, "key")?,
                &PathBuf::from(arg(m, "file")?),
                sse.as_ref(),
            )
            .await?;

            let mut out = serde_json::to_value(&done)?;
            if m.get_flag("generate-key") {
                if let (Some(key), Some(obj)) = (&sse, out.as_object_mut()) {
                    obj.insert("sse_key".to_string(), key.to_base64().into());
                }
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Some(("get", m)) => {
            let store = commands::open_store(&data_dir)?;
            let sse = commands::parse_key(m.get_one::<String>("sse-key").map(String::as_str))?;
            let data = commands::get(&store, arg(m, "bucket")?, arg(m, "key")?, sse.as_ref())?;

            let output = arg(m, "output")?;
            std::fs::write(output, &data).with_context(|| format!("writing {}", output))?;
            info!("Wrote {} bytes to {}", data.len(), output);
        }
        Some(("list-uploads", m)) => {
            let store = commands::open_store(&data_dir)?;
            let uploads = commands::list_uploads(&store, arg(m, "bucket")?)?;
            println!("{}", serde_json::to_string_pretty(&uploads)?);
        }
        Some(("list-parts", m)) => {
            let store = commands::open_store(&data_dir)?;
            let parts = commands::list_parts(&store, arg(m, "bucket")?, arg(m, "upload-id")?)?;
            println!("{}", serde_json::to_string_pretty(&parts)?);
        }
        Some(("abort", m)) => {
            let store = commands::open_store(&data_dir)?;
            let upload_id = arg(m, "upload-id")?;
            commands::abort(&store, arg(m, "bucket")?, arg(m, "key")?, upload_id).await?;
            info!("Aborted upload {}", upload_id);
        }
        _ => unreachable!("clap enforces a subcommand"),
    }

    Ok(())
}
