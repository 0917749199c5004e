use uuid::Uuid;

pub fn request_id() -> String {
    format!("dsp-{}", Uuid::new_v4().simple())
}

/// 进程内单调递增的序号（用于凭据轮换的"最近使用"排序）。
pub fn next_sequence() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(1);
    SEQ.fetch_add(1, Ordering::Relaxed)
}
