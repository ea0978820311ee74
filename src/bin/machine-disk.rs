use std::path::PathBuf;

use machine_disk::{
    DiskPuller, ImageFormat, ImageSource, ImageSourceConfig, OciKind, OciOptions, PullRequest,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "pull" => cmd_pull(&args[2..])?,
        "reference" => cmd_reference(&args[2..])?,
        "version" | "--version" | "-V" => println!("machine-disk {}", env!("CARGO_PKG_VERSION")),
        "help" | "--help" | "-h" => print_usage(),
        _ => {
            eprintln!("unknown command: {}", args[1]);
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load_config(args: &[String]) -> Result<ImageSourceConfig, Box<dyn std::error::Error>> {
    let config = match arg_value(args, "--config") {
        Some(path) => ImageSourceConfig::load(&PathBuf::from(path))?,
        None => ImageSourceConfig::default(),
    };
    let mut config = config.with_env_overrides();
    if has_flag(args, "--dev") {
        config.dev_override = true;
    }
    Ok(config)
}

fn source_request(args: &[String]) -> Result<PullRequest, Box<dyn std::error::Error>> {
    let format: ImageFormat = arg_value(args, "--format")
        .unwrap_or_else(|| "qcow2".to_string())
        .parse()?;

    let opts = match arg_value(args, "--oci-dir") {
        Some(dir) => OciOptions {
            kind: Some(OciKind::Directory),
            dir: Some(PathBuf::from(dir)),
        },
        None => OciOptions::default(),
    };

    Ok(PullRequest {
        format,
        instance: String::new(),
        image_dir: PathBuf::new(),
        opts,
        user_image: arg_value(args, "--image"),
    })
}

fn cmd_pull(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let mut req = source_request(args)?;
    req.instance = arg_value(args, "--name").ok_or("pull requires --name <vm>")?;
    req.image_dir = arg_value(args, "--dir")
        .map(PathBuf::from)
        .ok_or("pull requires --dir <image-dir>")?;
    let store = arg_value(args, "--store")
        .map(PathBuf::from)
        .unwrap_or_else(|| req.image_dir.join("cache"));

    let disk = DiskPuller::new(config, store).pull(&req)?;
    println!("{}", disk.path().display());
    Ok(())
}

fn cmd_reference(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let req = source_request(args)?;
    match DiskPuller::new(config, std::env::temp_dir()).resolve_source(&req)? {
        ImageSource::Registry(reference) => println!("{}", reference),
        ImageSource::Directory(dir) => println!("{}", dir.display()),
    }
    Ok(())
}

fn arg_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn print_usage() {
    eprintln!(
        "machine-disk - fetch VM disk images

USAGE:
  machine-disk pull --name <vm> --dir <image-dir> [--format qcow2|raw|vhdx|tar]
                    [--image <ref>] [--oci-dir <path>] [--store <path>]
                    [--config <file.yaml>] [--dev]
  machine-disk reference [--format <fmt>] [--image <ref>] [--oci-dir <path>] [--dev]
  machine-disk version

ENVIRONMENT:
  MACHINE_DISK_REGISTRY, MACHINE_DISK_REPOSITORY, MACHINE_DISK_IMAGE,
  MACHINE_DISK_DEV_OVERRIDE, RUST_LOG"
    );
}
