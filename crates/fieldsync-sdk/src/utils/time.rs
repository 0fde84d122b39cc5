//! 时间处理工具模块
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（i64）
//! - **业务层**: 统一使用 `TimeFormatter::now_millis()` 生成时间
//! - **显示层**: "多久之前同步" 这类短文本由本模块生成

use chrono::{DateTime, TimeZone, Utc};

/// 时间格式化工具
pub struct TimeFormatter;

impl TimeFormatter {
    /// 当前 UTC 毫秒时间戳
    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// UTC 毫秒时间戳转 DateTime，非法值回退为当前时间
    pub fn to_datetime(utc_timestamp_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(utc_timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// 格式化为 ISO 8601 格式
    pub fn format_iso8601(utc_timestamp_ms: i64) -> String {
        Self::to_datetime(utc_timestamp_ms).to_rfc3339()
    }

    /// 距离现在的秒数（未来时间按 0 处理）
    pub fn seconds_since(utc_timestamp_ms: i64) -> u64 {
        let elapsed = (Self::now_millis() - utc_timestamp_ms) / 1000;
        elapsed.max(0) as u64
    }

    /// 把经过的秒数格式化为短文本："30s ago" / "2m ago" / "2h ago" / "2d ago"
    pub fn format_elapsed(seconds: u64) -> String {
        if seconds < 60 {
            format!("{}s ago", seconds)
        } else if seconds < 3600 {
            format!("{}m ago", seconds / 60)
        } else if seconds < 86400 {
            format!("{}h ago", seconds / 3600)
        } else {
            format!("{}d ago", seconds / 86400)
        }
    }
}
