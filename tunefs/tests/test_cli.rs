use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use libtunefs::ondisk::IncompatFeatures;
use libtunefs::ondisk::image::{ImageBuilder, VolumeImage};
use tunefs::cli::{Cli, Commands};
use tunefs::config::load_config;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("tunefs").chain(args.iter().copied())).unwrap()
}

#[test]
fn test_parse_feature_command() {
    let cli = parse(&["-i", "-vv", "--config", "/tmp/t.yaml", "/dev/sdb", "inline-data", "enable"]);
    assert!(cli.interactive);
    assert_eq!(cli.verbose, 2);
    assert_eq!(cli.quiet, 0);
    assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.yaml")));
    assert_eq!(cli.device, PathBuf::from("/dev/sdb"));
    assert_eq!(
        cli.command,
        Commands::InlineData {
            args: vec!["enable".to_string()]
        }
    );
}

#[test]
fn test_raw_arguments_pass_through() {
    let cli = parse(&["-q", "/dev/sdb", "journal-size"]);
    assert_eq!(cli.quiet, 1);
    assert_eq!(cli.command, Commands::JournalSize { args: vec![] });

    // The runner rejects these, not the parser.
    let cli = parse(&["/dev/sdb", "journal-size", "64M", "extra"]);
    assert_eq!(
        cli.command,
        Commands::JournalSize {
            args: vec!["64M".to_string(), "extra".to_string()]
        }
    );

    let cli = parse(&["/dev/sdb", "probe"]);
    assert_eq!(cli.command, Commands::Probe);
}

#[test]
fn test_missing_device_or_command() {
    assert!(Cli::try_parse_from(["tunefs"]).is_err());
    assert!(Cli::try_parse_from(["tunefs", "/dev/sdb"]).is_err());
    assert!(Cli::try_parse_from(["tunefs", "/dev/sdb", "sparse"]).is_err());
}

#[test]
fn test_load_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tunefs.yaml");
    fs::write(
        &path,
        "cluster_stack: pcmk\nlock_dir: /srv/locks\nlock_env: _MY_LOCK\ninteractive: true\n",
    )
    .unwrap();

    let cfg = load_config(Some(&path)).unwrap();
    assert_eq!(cfg.cluster_stack, "pcmk");
    assert_eq!(cfg.lock_dir, PathBuf::from("/srv/locks"));
    assert_eq!(cfg.lock_env, "_MY_LOCK");
    assert!(cfg.interactive);

    let err = load_config(Some(&dir.path().join("absent.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Failed to read config"));

    fs::write(&path, "cluster_stack: [\n").unwrap();
    assert!(load_config(Some(&path)).is_err());
}

fn write_config(dir: &Path, lock_env: &str) -> PathBuf {
    let path = dir.join("tunefs.yaml");
    fs::write(
        &path,
        format!(
            "lock_dir: {}\nlock_env: {lock_env}\n",
            dir.join("locks").display()
        ),
    )
    .unwrap();
    path
}

#[test]
fn test_run_enables_inline_data() {
    let dir = tempfile::tempdir().unwrap();
    let device = dir.path().join("volume.img");
    ImageBuilder::new().write_to(&device).unwrap();
    let lock_env = "_TUNEFS_TEST_CLI_RUN";
    let config = write_config(dir.path(), lock_env);

    let cli = Cli {
        interactive: false,
        verbose: 0,
        quiet: 0,
        config: Some(config),
        device: device.clone(),
        command: Commands::InlineData {
            args: vec!["enable".to_string()],
        },
    };
    tunefs::run(&cli);

    let image = VolumeImage::load(&device).unwrap();
    assert!(
        image
            .super_block
            .feature_incompat
            .contains(IncompatFeatures::INLINE_DATA)
    );
    assert!(std::env::var_os(lock_env).is_none());
}
