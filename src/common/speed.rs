use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 传输速度计算器（滑动窗口）
///
/// 记录累计字节数的时间点，速度 = 窗口内首尾累计量之差 / 时间差。
#[derive(Debug)]
pub struct SpeedCalculator {
    /// (时间点, 截至该时间点的累计字节数)
    points: VecDeque<(Instant, u64)>,
    window: Duration,
    total_bytes: u64,
}

impl SpeedCalculator {
    pub fn new(window_secs: u64) -> Self {
        Self {
            points: VecDeque::new(),
            window: Duration::from_secs(window_secs.max(1)),
            total_bytes: 0,
        }
    }

    /// 记录新传输的字节数
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        self.total_bytes += bytes;
        self.points.push_back((now, self.total_bytes));

        while self.points.len() > 1 {
            match self.points.front() {
                Some((t, _)) if now.duration_since(*t) > self.window => {
                    self.points.pop_front();
                }
                _ => break,
            }
        }
    }

    /// 当前速度（字节/秒），样本不足时为 0
    pub fn speed(&self) -> u64 {
        let (Some((first_at, first_total)), Some((last_at, last_total))) =
            (self.points.front(), self.points.back())
        else {
            return 0;
        };

        let elapsed = last_at.duration_since(*first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        ((last_total - first_total) as f64 / elapsed) as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_needs_two_points() {
        let mut calc = SpeedCalculator::new(5);
        assert_eq!(calc.speed(), 0);
        calc.record(1024);
        assert_eq!(calc.speed(), 0);
        assert_eq!(calc.total_bytes(), 1024);
    }

    #[test]
    fn test_speed_over_window() {
        let mut calc = SpeedCalculator::new(5);
        let start = Instant::now();
        calc.record_at(start, 0);
        calc.record_at(start + Duration::from_secs(1), 1000);
        calc.record_at(start + Duration::from_secs(2), 1000);
        assert_eq!(calc.speed(), 1000);
    }

    #[test]
    fn test_old_points_are_dropped() {
        let mut calc = SpeedCalculator::new(2);
        let start = Instant::now();
        calc.record_at(start, 10_000);
        calc.record_at(start + Duration::from_secs(1), 100);
        calc.record_at(start + Duration::from_secs(10), 100);
        calc.record_at(start + Duration::from_secs(11), 100);

        // 只剩窗口内的两个点：相隔 1 秒、增量 100
        assert_eq!(calc.speed(), 100);
        assert_eq!(calc.total_bytes(), 10_300);
    }
}
