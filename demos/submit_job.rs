use nvhost_rs::config::{DeviceConfig, HostConfig};
use nvhost_rs::host::{ChannelFiles, Host};
use nvhost_rs::nvmap::PAGE_SIZE;
use nvhost_rs::uapi::UserSpace;
use nvhost_rs::uapi::ioctl::{
    Cmdbuf, GetParamArg, GetParamArgs, NVHOST_IOCTL_CHANNEL_GET_SYNCPOINT,
    NVHOST_IOCTL_CHANNEL_GET_SYNCPOINTS, NVHOST_IOCTL_CHANNEL_SET_TIMEOUT,
    NVHOST_IOCTL_CHANNEL_SUBMIT, SetTimeoutArgs, SubmitArgs, SyncptIncr,
};
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn check(what: &str, status: i64) -> Result<(), Box<dyn std::error::Error>> {
    if status != 0 {
        return Err(format!("{what} failed (status {status})").into());
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("============================================================");
    println!("               nvhost-rs - Channel Submit Demo              ");
    println!("============================================================");

    // 1. Configuration: a TOML file if given, otherwise a single VIC engine
    let config = match std::env::args().nth(1) {
        Some(path) => {
            println!("[+] Loading configuration from {path}...");
            HostConfig::from_file(Path::new(&path))?
        }
        None => HostConfig::default().with_device(DeviceConfig::new("vic", 0x5d).push_work_done()),
    };
    let dev_name = config
        .devices
        .first()
        .map(|d| d.name.clone())
        .ok_or("configuration lists no devices")?;

    // 2. Bring up the host
    println!("[+] Creating host ({} sync points)...", config.num_syncpts);
    let host = Host::new(config)?;
    let files = ChannelFiles::new(host.clone());
    let user = UserSpace::new();

    // 3. Open a channel
    let fd = files.open(&dev_name)?;
    println!("[+] Opened {dev_name} as fd {fd}");

    // 4. Reserve a sync point
    let arg = user.alloc_pod(&GetParamArg { param: 0, value: 0 });
    check("GET_SYNCPOINT", files.ioctl(fd, NVHOST_IOCTL_CHANNEL_GET_SYNCPOINT, arg, &user))?;
    let syncpt = user.read_pod::<GetParamArg>(arg)?.value;
    println!("    Sync point: {syncpt}");

    let arg = user.alloc_pod(&GetParamArgs::default());
    check("GET_SYNCPOINTS", files.ioctl(fd, NVHOST_IOCTL_CHANNEL_GET_SYNCPOINTS, arg, &user))?;
    println!("    Reserved mask: 0x{:08x}", user.read_pod::<GetParamArgs>(arg)?.value);

    // 5. Set a timeout
    let arg = user.alloc_pod(&SetTimeoutArgs { timeout: 5000 });
    check("SET_TIMEOUT", files.ioctl(fd, NVHOST_IOCTL_CHANNEL_SET_TIMEOUT, arg, &user))?;

    // 6. Build a command buffer
    println!("[+] Allocating command buffer...");
    let handle = host.nvmap().create_handle(PAGE_SIZE)?;
    let mem = u32::try_from(host.nvmap().export(&handle))?;
    for (i, word) in [0x1000_0001u32, 0x0000_0000, 0x2000_0000, 0x0000_0001].iter().enumerate() {
        handle.dmabuf().write_u32(4 * i as u64, *word)?;
    }

    // 7. Submit
    let cmdbufs = user.alloc_slice(&[Cmdbuf { mem, offset: 0, words: 4 }]);
    let incrs = user.alloc_slice(&[SyncptIncr { syncpt_id: syncpt, syncpt_incrs: 1 }]);
    let args = SubmitArgs {
        num_syncpt_incrs: 1,
        num_cmdbufs: 1,
        cmdbufs,
        syncpt_incrs: incrs,
        ..Default::default()
    };
    let arg = user.alloc_pod(&args);
    println!("[+] Submitting job...");
    check("SUBMIT", files.ioctl(fd, NVHOST_IOCTL_CHANNEL_SUBMIT, arg, &user))?;
    let fence = user.read_pod::<SubmitArgs>(arg)?.fence;

    let syncpts = host.syncpts();
    println!("    Fence: {fence}");
    println!(
        "    Counters: min={} max={}",
        syncpts.read_min(syncpt),
        syncpts.read_max(syncpt)
    );
    println!(
        "    Fence reached: {}",
        if syncpts.is_expired(syncpt, fence) { "yes" } else { "no" }
    );

    // 8. Release
    files.release(fd)?;
    println!("[+] Released fd {fd}, {} sync points still assigned", syncpts.assigned_count());
    println!("============================================================");
    Ok(())
}
