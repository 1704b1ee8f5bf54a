//! Mounting a stick and running count and backup operations against it.
//!
//! The core is blocking end to end, and a mounted FAT volume cannot leave the thread
//! that mounted it. A [`Session`] therefore owns one worker thread that mounts the
//! volume and then serves requests one at a time until the session is closed.

use std::io::{self, Cursor, Write};
use std::thread::{self, JoinHandle};

use color_eyre::Result;
use color_eyre::eyre::eyre;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::backup::{self, BackupOutcome, CountOutcome};
use crate::config::Settings;
use crate::disk::{BlockDevice, FatType, LogicalDisk, PartitionError};
use crate::fs::{FatFs, FileSystem};
use crate::scsi::ScsiDevice;
use crate::usb::ram::RamDrive;
use crate::usb::{self, BulkOnlyTransport, BulkPipe};

pub type Pipe = Box<dyn BulkPipe>;
pub type Volume = FatFs<LogicalDisk<Pipe>>;

/// Size of the generated mock stick.
pub const MOCK_IMAGE_SIZE: usize = 64 << 20;
const MOCK_ROOT_FILES: usize = 10;
const MOCK_ROOT_FILE_SIZE: usize = 5 * 1024;
const MOCK_PHOTOS: usize = 155;
const MOCK_PHOTO_SIZE: usize = 100 * 1024;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("no USB mass storage device found")]
    NoDevice,

    #[error("failed to open the USB device: {0:#}")]
    Usb(color_eyre::Report),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("failed to mount the FAT volume: {0}")]
    Filesystem(#[source] io::Error),

    #[error("failed to build the mock device: {0}")]
    MockImage(#[source] io::Error),

    #[error("failed to start the volume worker: {0}")]
    Worker(#[source] io::Error),
}

/// Number of files attempted so far by a running backup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Progress(pub u32);

/// Bring a mass storage unit up to a mounted FAT volume.
///
/// The device stays read-only unless `read_only` is false.
#[tracing::instrument(skip(pipe))]
pub fn mount_pipe(pipe: Pipe, read_only: bool) -> Result<Volume, MountError> {
    let transport = BulkOnlyTransport::new(pipe);
    let mut device = BlockDevice::new(ScsiDevice::new(transport));
    let partition = device.init()?;
    if partition.fat_type == FatType::Unsupported {
        return Err(PartitionError::Unsupported(partition.fat_type).into());
    }
    device.set_read_only(read_only);
    let disk = LogicalDisk::new(device, partition);
    let volume = fatfs::FileSystem::new(disk, fatfs::FsOptions::new())
        .map_err(MountError::Filesystem)?;
    info!("mounted {:?} volume", volume.fat_type());
    Ok(volume)
}

/// A FAT image shaped like a camera card: a few loose files in the root and a
/// directory of photos under `DCIM/100_PANO`.
pub fn mock_image() -> io::Result<Vec<u8>> {
    let mut image = Cursor::new(vec![0u8; MOCK_IMAGE_SIZE]);
    fatfs::format_volume(&mut image, fatfs::FormatVolumeOptions::new())?;
    image.set_position(0);
    let fs = fatfs::FileSystem::new(&mut image, fatfs::FsOptions::new())?;
    {
        let root = fs.root_dir();
        for i in 0..MOCK_ROOT_FILES {
            let mut file = root.create_file(&format!("note_{i:02}.txt"))?;
            file.write_all(&vec![b'a' + i as u8; MOCK_ROOT_FILE_SIZE])?;
        }
        let photos = root.create_dir("DCIM")?.create_dir("100_PANO")?;
        for i in 0..MOCK_PHOTOS {
            let mut file = photos.create_file(&format!("image_{i:02}.jpg"))?;
            let body: Vec<u8> = (0..MOCK_PHOTO_SIZE).map(|b| (b ^ i) as u8).collect();
            file.write_all(&body)?;
        }
    }
    fs.unmount()?;
    Ok(image.into_inner())
}

enum Request {
    Count {
        list: bool,
        reply: oneshot::Sender<Result<Option<CountOutcome>>>,
    },
    Backup {
        progress: UnboundedSender<Progress>,
        reply: oneshot::Sender<Result<Option<BackupOutcome>>>,
    },
}

fn count(volume: &Volume, settings: &Settings, list: bool) -> Result<Option<CountOutcome>> {
    let source = &settings.source_path;
    let root = volume.root();
    let Some(dir) = backup::navigate(&root, source)? else {
        return Ok(None);
    };
    let outcome = backup::count_files(&dir, source, settings.extension_filter(), list)?;
    debug!("{} files below {source}", outcome.count);
    Ok(Some(outcome))
}

fn run_backup(
    volume: &Volume,
    settings: &Settings,
    progress: UnboundedSender<Progress>,
) -> Result<Option<BackupOutcome>> {
    let root = volume.root();
    let Some(dir) = backup::navigate(&root, &settings.source_path)? else {
        return Ok(None);
    };
    let outcome = backup::run_backup(
        &dir,
        &settings.destination_path,
        settings.backup_options(),
        |n| {
            if progress.send(Progress(n)).is_err() {
                warn!("progress receiver went away");
            }
        },
    )?;
    Ok(Some(outcome))
}

/// Body of the volume worker: mount, report the result, then serve requests until
/// every sender is gone.
fn serve(
    pipe: Pipe,
    settings: Settings,
    mounted: oneshot::Sender<Result<(), MountError>>,
    mut requests: UnboundedReceiver<Request>,
) -> io::Result<()> {
    let volume = match mount_pipe(pipe, settings.read_only()) {
        Ok(volume) => volume,
        Err(e) => {
            let _ = mounted.send(Err(e));
            return Ok(());
        }
    };
    if mounted.send(Ok(())).is_err() {
        return volume.unmount();
    }
    while let Some(request) = requests.blocking_recv() {
        let delivered = match request {
            Request::Count { list, reply } => reply.send(count(&volume, &settings, list)).is_ok(),
            Request::Backup { progress, reply } => {
                reply.send(run_backup(&volume, &settings, progress)).is_ok()
            }
        };
        if !delivered {
            warn!("session dropped a request before it completed");
        }
    }
    debug!("unmounting");
    volume.unmount()
}

pub struct Session {
    requests: UnboundedSender<Request>,
    worker: JoinHandle<io::Result<()>>,
    settings: Settings,
}

impl Session {
    /// Open the first USB stick, or the mock device, and mount it.
    pub async fn mount(settings: Settings) -> Result<Self> {
        let pipe: Pipe = if settings.mock_device {
            info!("using the mock device");
            let image = spawn_blocking(mock_image)
                .await?
                .map_err(MountError::MockImage)?;
            Box::new(RamDrive::new(512, image))
        } else {
            let device_info = usb::enumerate_usb_storage_devices()
                .await?
                .next()
                .ok_or(MountError::NoDevice)?;
            info!(
                "using {} {}",
                device_info.manufacturer_string().unwrap_or("unknown vendor"),
                device_info.product_string().unwrap_or("unknown product")
            );
            let pipe = usb::open_usb_device(device_info)
                .await
                .map_err(MountError::Usb)?;
            Box::new(pipe)
        };
        Self::open(pipe, settings).await
    }

    /// Start the volume worker on an already opened unit and wait for the mount.
    pub async fn open(pipe: Pipe, settings: Settings) -> Result<Self> {
        let (requests, inbox) = mpsc::unbounded_channel();
        let (mounted, mount_result) = oneshot::channel();
        let worker_settings = settings.clone();
        let worker = thread::Builder::new()
            .name("stickcopy-volume".to_owned())
            .spawn(move || serve(pipe, worker_settings, mounted, inbox))
            .map_err(MountError::Worker)?;
        mount_result
            .await
            .map_err(|_| eyre!("volume worker stopped while mounting"))??;
        Ok(Self {
            requests,
            worker,
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Count the files below the source directory, `None` when it does not exist.
    pub async fn count(&self, list: bool) -> Result<Option<CountOutcome>> {
        let (reply, answer) = oneshot::channel();
        self.submit(Request::Count { list, reply })?;
        answer.await.map_err(|_| eyre!("volume worker has stopped"))?
    }

    /// Copy the source directory to the destination, reporting each file attempted
    /// on `progress`. `None` when the source directory does not exist.
    pub async fn backup(
        &self,
        progress: UnboundedSender<Progress>,
    ) -> Result<Option<BackupOutcome>> {
        let (reply, answer) = oneshot::channel();
        self.submit(Request::Backup { progress, reply })?;
        answer.await.map_err(|_| eyre!("volume worker has stopped"))?
    }

    /// Unmount the volume and wait for the worker to finish.
    pub async fn close(self) -> Result<()> {
        let Self {
            requests, worker, ..
        } = self;
        drop(requests);
        let unmounted = spawn_blocking(move || worker.join())
            .await?
            .map_err(|_| eyre!("volume worker panicked"))?;
        unmounted?;
        Ok(())
    }

    fn submit(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| eyre!("volume worker has stopped"))
    }
}
