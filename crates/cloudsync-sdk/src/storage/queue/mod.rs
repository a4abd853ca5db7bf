//! 持久化同步队列
//!
//! 两张"队列表"都落在 KvStore 上，随进程重启存活：
//! - `PendingUploadStore`：待上传的本地变更，按 `(cloud_id, type)` 唯一
//! - `DeferredRecordStore`：因父实体缺失暂存的入站记录

pub mod deferred_record;
pub mod pending_upload;

pub use deferred_record::{DeferredRecord, DeferredRecordStore};
pub use pending_upload::{PendingUpload, PendingUploadStore};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::error::{CloudSyncError, Result};

/// 本地唯一、单调递增的 luid 生成器（Snowflake）
pub struct LuidGenerator {
    snowflake: snowflake_me::Snowflake,
}

impl LuidGenerator {
    pub fn new() -> Result<Self> {
        // machine_id / data_center_id 各 5 bit；手动指定避免 IP 探测失败
        let mut rng = StdRng::from_entropy();
        let machine_id: u16 = rng.gen_range(0..32);
        let data_center_id: u16 = rng.gen_range(0..32);

        let snowflake = snowflake_me::Snowflake::builder()
            .machine_id(&|| Ok(machine_id))
            .data_center_id(&|| Ok(data_center_id))
            .finalize()
            .map_err(|e| CloudSyncError::Other(format!("初始化 Snowflake 失败: {:?}", e)))?;

        info!(
            "✅ luid 生成器初始化完成 (machine_id={}, data_center_id={})",
            machine_id, data_center_id
        );
        Ok(Self { snowflake })
    }

    pub fn next_luid(&self) -> Result<u64> {
        self.snowflake
            .next_id()
            .map_err(|e| CloudSyncError::Other(format!("生成 luid 失败: {:?}", e)))
    }
}

impl std::fmt::Debug for LuidGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuidGenerator").finish()
    }
}
