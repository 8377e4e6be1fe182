//! 雪花 ID 生成器
//!
//! 位布局：符号位(0) + 41 位时间差 + 13 位 worker（4 位业务 / 3 位机房 / 6 位机器）+ 9 位序列号。

use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, RouteError};

/// 起始纪元 2024-01-01T00:00:00Z（毫秒）
pub const EPOCH_MS: i64 = 1_704_067_200_000;

const BIZ_BITS: u32 = 4;
const DATACENTER_BITS: u32 = 3;
const MACHINE_BITS: u32 = 6;
const SEQUENCE_BITS: u32 = 9;
const WORKER_BITS: u32 = BIZ_BITS + DATACENTER_BITS + MACHINE_BITS;
const TIMESTAMP_SHIFT: u32 = WORKER_BITS + SEQUENCE_BITS;
const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;

/// 13 位 worker 标识
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerId(u16);

impl WorkerId {
    /// 任一分量超出位宽即视为致命配置错误
    pub fn new(biz_id: u16, datacenter_id: u16, machine_id: u16) -> Result<Self> {
        check_width("biz_id", biz_id, BIZ_BITS)?;
        check_width("datacenter_id", datacenter_id, DATACENTER_BITS)?;
        check_width("machine_id", machine_id, MACHINE_BITS)?;
        Ok(Self(
            biz_id << (DATACENTER_BITS + MACHINE_BITS) | datacenter_id << MACHINE_BITS | machine_id,
        ))
    }

    /// 直接使用 13 位 worker 值
    pub fn from_raw(raw: u16) -> Result<Self> {
        check_width("worker_id", raw, WORKER_BITS)?;
        Ok(Self(raw))
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

fn check_width(field: &str, value: u16, bits: u32) -> Result<()> {
    if u32::from(value) >= 1 << bits {
        return Err(RouteError::ConfigurationFatal(format!(
            "{field} {value} exceeds {bits} bits"
        )));
    }
    Ok(())
}

/// 时钟抽象（测试中可替换为手动时钟）
pub trait Clock: Send + Sync {
    /// 当前 Unix 毫秒
    fn now_millis(&self) -> i64;
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// 解析后的雪花 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeParts {
    pub timestamp_ms: i64,
    pub worker_id: u16,
    pub sequence: u16,
}

#[derive(Default)]
struct GeneratorState {
    last_timestamp: i64,
    sequence: i64,
}

/// 雪花 ID 生成器
///
/// 每次调用在同一把锁内完成，保证单实例内严格不递减且不重复。
/// 同一毫秒序列号耗尽或时钟回拨时，调用会阻塞直到时钟前进。
pub struct SnowflakeGenerator<C: Clock = SystemClock> {
    worker_id: WorkerId,
    clock: C,
    state: Mutex<GeneratorState>,
}

impl SnowflakeGenerator<SystemClock> {
    pub fn new(worker_id: WorkerId) -> Self {
        Self::with_clock(worker_id, SystemClock)
    }
}

impl<C: Clock> SnowflakeGenerator<C> {
    pub fn with_clock(worker_id: WorkerId, clock: C) -> Self {
        Self {
            worker_id,
            clock,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// 生成下一个 ID
    pub fn next_id(&self) -> i64 {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut now = self.clock.now_millis();
        if now < state.last_timestamp {
            warn!(
                last_timestamp = state.last_timestamp,
                now,
                "Clock moved backwards, waiting for it to catch up"
            );
            while now < state.last_timestamp {
                std::thread::sleep(Duration::from_millis(1));
                now = self.clock.now_millis();
            }
        }

        if now == state.last_timestamp {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                debug!(timestamp = now, "Sequence exhausted, waiting for next millisecond");
                while now <= state.last_timestamp {
                    std::thread::yield_now();
                    now = self.clock.now_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_timestamp = now;

        (now - EPOCH_MS) << TIMESTAMP_SHIFT
            | i64::from(self.worker_id.0) << SEQUENCE_BITS
            | state.sequence
    }

    /// 拆解 ID
    pub fn parse(id: i64) -> SnowflakeParts {
        SnowflakeParts {
            timestamp_ms: (id >> TIMESTAMP_SHIFT) + EPOCH_MS,
            worker_id: ((id >> SEQUENCE_BITS) & ((1 << WORKER_BITS) - 1)) as u16,
            sequence: (id & MAX_SEQUENCE) as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Clone)]
    struct ManualClock(Arc<AtomicI64>);

    impl Clock for ManualClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_worker_id_bounds() {
        assert_eq!(WorkerId::new(15, 7, 63).unwrap().value(), 0x1FFF);
        assert_eq!(WorkerId::new(1, 0, 0).unwrap().value(), 1 << 9);
        assert!(matches!(
            WorkerId::new(16, 0, 0),
            Err(RouteError::ConfigurationFatal(_))
        ));
        assert!(WorkerId::new(0, 8, 0).is_err());
        assert!(WorkerId::new(0, 0, 64).is_err());
        assert!(WorkerId::from_raw(1 << 13).is_err());
    }

    #[test]
    fn test_monotonic_and_unique() {
        let generator = SnowflakeGenerator::new(WorkerId::new(1, 2, 3).unwrap());
        let mut last = 0;
        let mut seen = HashSet::with_capacity(100_000);
        for _ in 0..100_000 {
            let id = generator.next_id();
            assert!(id > last);
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn test_parse_roundtrips_components() {
        let worker = WorkerId::new(3, 5, 17).unwrap();
        let clock = ManualClock(Arc::new(AtomicI64::new(EPOCH_MS + 12_345)));
        let generator = SnowflakeGenerator::with_clock(worker, clock);
        generator.next_id();
        let id = generator.next_id();

        let parts = SnowflakeGenerator::<ManualClock>::parse(id);
        assert_eq!(parts.timestamp_ms, EPOCH_MS + 12_345);
        assert_eq!(parts.worker_id, worker.value());
        assert_eq!(parts.sequence, 1);
    }

    #[test]
    fn test_sequence_overflow_waits_for_next_millisecond() {
        let now = Arc::new(AtomicI64::new(EPOCH_MS + 1_000));
        let generator =
            Arc::new(SnowflakeGenerator::with_clock(WorkerId::from_raw(1).unwrap(), ManualClock(now.clone())));

        let mut last = 0;
        for _ in 0..=MAX_SEQUENCE {
            last = generator.next_id();
        }

        let ticker = {
            let now = now.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                now.fetch_add(1, Ordering::SeqCst);
            })
        };
        let next = generator.next_id();
        ticker.join().unwrap();

        assert!(next > last);
        assert_eq!(SnowflakeGenerator::<ManualClock>::parse(next).sequence, 0);
        assert_eq!(
            SnowflakeGenerator::<ManualClock>::parse(next).timestamp_ms,
            EPOCH_MS + 1_001
        );
    }

    #[test]
    fn test_clock_rollback_blocks_until_caught_up() {
        let now = Arc::new(AtomicI64::new(EPOCH_MS + 10_000));
        let generator = Arc::new(SnowflakeGenerator::with_clock(
            WorkerId::from_raw(7).unwrap(),
            ManualClock(now.clone()),
        ));
        let before = generator.next_id();

        // 回拨 50ms
        now.fetch_sub(50, Ordering::SeqCst);

        let worker = {
            let generator = generator.clone();
            std::thread::spawn(move || generator.next_id())
        };
        std::thread::sleep(Duration::from_millis(40));
        assert!(!worker.is_finished());

        now.fetch_add(50, Ordering::SeqCst);
        let after = worker.join().unwrap();
        assert!(after > before);
    }
}
