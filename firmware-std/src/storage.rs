//! Data partition mount.

use std::ffi::CStr;

use esp_idf_svc::sys::{
    esp, esp_vfs_fat_mount_config_t, esp_vfs_fat_spiflash_mount_rw_wl, wl_handle_t,
};

/// VFS mount point of the data partition.
pub const MOUNT_POINT: &str = "/data";

const MOUNT_POINT_C: &CStr = c"/data";
const PARTITION_LABEL: &CStr = c"storage";

/// Mount the wear-levelled FAT `storage` partition at [`MOUNT_POINT`],
/// formatting it on first boot.
pub fn mount_data_partition() -> anyhow::Result<()> {
    let config = esp_vfs_fat_mount_config_t {
        format_if_mount_failed: true,
        max_files: 4,
        allocation_unit_size: 4096,
        ..Default::default()
    };
    let mut handle: wl_handle_t = 0;
    unsafe {
        esp!(esp_vfs_fat_spiflash_mount_rw_wl(
            MOUNT_POINT_C.as_ptr(),
            PARTITION_LABEL.as_ptr(),
            &config,
            &mut handle,
        ))?;
    }
    log::info!("data partition mounted at {}", MOUNT_POINT);
    Ok(())
}
