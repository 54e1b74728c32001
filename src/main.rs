use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fuser::MountOption;
use log::info;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hitsz_logfs::vfs::LogFs;
use hitsz_logfs::{mkfs, BlockDevice, Config, FileDisk, FileSystem, MkfsParams, BSIZE};

#[derive(Parser)]
#[command(version, about = "Journaling file system served over FUSE")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format an image file, creating or resizing it
    Mkfs {
        image: PathBuf,
        #[arg(long, default_value_t = MkfsParams::default().num_blocks)]
        blocks: usize,
        #[arg(long, default_value_t = MkfsParams::default().num_inodes)]
        inodes: usize,
        /// log region size, header block included
        #[arg(long, default_value_t = MkfsParams::default().num_log_blocks)]
        log_blocks: usize,
    },
    /// Replay the log and serve the image at MOUNTPOINT
    Mount {
        image: PathBuf,
        mountpoint: PathBuf,
        #[command(flatten)]
        config: Config,
    },
    /// Replay the log and print the layout
    Check {
        image: PathBuf,
        #[command(flatten)]
        config: Config,
    },
}

fn open_image(image: &Path, config: Config) -> Result<FileSystem> {
    let disk = FileDisk::open(image)
        .with_context(|| format!("unable to open {} in read-write mode", image.display()))?;
    let num_blocks = disk.num_blocks()?;
    let device: Arc<dyn BlockDevice> = Arc::new(disk);
    let fs = FileSystem::open_sized(device, num_blocks, config)
        .with_context(|| format!("unable to mount {}", image.display()))?;
    Ok(fs)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Mkfs {
            image,
            blocks,
            inodes,
            log_blocks,
        } => {
            let params = MkfsParams {
                num_blocks: blocks,
                num_inodes: inodes,
                num_log_blocks: log_blocks,
            };
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&image)
                .with_context(|| format!("unable to create {}", image.display()))?;
            file.set_len((blocks * BSIZE) as u64)?;
            let sb = mkfs(&FileDisk::new(file), &params)?;
            println!(
                "{}: {} blocks, {} inodes, log {}..{}, data from {}",
                image.display(),
                sb.num_blocks,
                sb.num_inodes,
                sb.log_start,
                sb.log_start + sb.num_log_blocks,
                sb.data_start
            );
        }
        Command::Mount {
            image,
            mountpoint,
            config,
        } => {
            let fs = open_image(&image, config)?;
            info!("serving {} at {}", image.display(), mountpoint.display());
            let options = [MountOption::FSName("logfs".to_string())];
            fuser::mount2(LogFs::new(Arc::new(fs)), &mountpoint, &options)
                .with_context(|| format!("unable to mount at {}", mountpoint.display()))?;
        }
        Command::Check { image, config } => {
            let fs = open_image(&image, config)?;
            let sb = fs.super_block();
            println!("{sb:#?}");
            println!("free blocks: {}", fs.num_free_blocks());
            println!("free inodes: {}", fs.inodes().num_free_inodes());
            println!("{:#?}", fs.log_stats());
        }
    }
    Ok(())
}
