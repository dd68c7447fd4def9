use std::fmt;
use std::str::FromStr;

use crate::stats::{MetricKind, SeriesStats};

/// Aggregate a threshold compares against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Value,
    /// `p(N)`, N in `[0, 100]`.
    Percentile(f64),
}

impl Statistic {
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Statistic::Count | Statistic::Rate),
            MetricKind::Rate => matches!(self, Statistic::Rate),
            MetricKind::Trend => matches!(
                self,
                Statistic::Avg
                    | Statistic::Min
                    | Statistic::Max
                    | Statistic::Med
                    | Statistic::Count
                    | Statistic::Percentile(_)
            ),
            MetricKind::Gauge => matches!(self, Statistic::Value | Statistic::Min | Statistic::Max),
        }
    }

    /// Read this statistic off an aggregate. `elapsed_secs` feeds the
    /// per-second rate of counters. `None` if undefined for the kind or if
    /// the aggregate holds no samples.
    pub fn extract(&self, stats: &SeriesStats, elapsed_secs: f64) -> Option<f64> {
        if stats.sample_count() == 0 {
            return None;
        }
        match (self, stats) {
            (Statistic::Count, SeriesStats::Counter(c)) => Some(c.sum),
            (Statistic::Rate, SeriesStats::Counter(c)) => Some(c.per_second(elapsed_secs)),
            (Statistic::Rate, SeriesStats::Rate(r)) => r.rate(),
            (Statistic::Avg, SeriesStats::Trend(t)) => Some(t.avg()),
            (Statistic::Min, SeriesStats::Trend(t)) => Some(t.min),
            (Statistic::Max, SeriesStats::Trend(t)) => Some(t.max),
            (Statistic::Med, SeriesStats::Trend(t)) => Some(t.med()),
            (Statistic::Count, SeriesStats::Trend(t)) => Some(t.count as f64),
            (Statistic::Percentile(p), SeriesStats::Trend(t)) => Some(t.percentile(*p)),
            (Statistic::Value, SeriesStats::Gauge(g)) => Some(g.value),
            (Statistic::Min, SeriesStats::Gauge(g)) => Some(g.min),
            (Statistic::Max, SeriesStats::Gauge(g)) => Some(g.max),
            _ => None,
        }
    }

    fn parse(token: &str) -> Result<Self, String> {
        let token = token.trim();
        let stat = match token {
            "avg" => Statistic::Avg,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "med" => Statistic::Med,
            "count" => Statistic::Count,
            "rate" => Statistic::Rate,
            "value" => Statistic::Value,
            _ => {
                let pct = if let Some(inner) = token
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                {
                    inner.trim()
                } else if let Some(rest) = token.strip_prefix('p') {
                    rest
                } else {
                    return Err(format!("unknown statistic '{}'", token));
                };
                let value: f64 = pct
                    .parse()
                    .map_err(|_| format!("invalid percentile '{}'", token))?;
                if !(0.0..=100.0).contains(&value) {
                    return Err(format!("percentile {} is outside 0..100", value));
                }
                Statistic::Percentile(value)
            }
        };
        Ok(stat)
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::Avg => f.write_str("avg"),
            Statistic::Min => f.write_str("min"),
            Statistic::Max => f.write_str("max"),
            Statistic::Med => f.write_str("med"),
            Statistic::Count => f.write_str("count"),
            Statistic::Rate => f.write_str("rate"),
            Statistic::Value => f.write_str("value"),
            Statistic::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::Lt => lhs < rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Ge => lhs >= rhs,
            Comparator::Eq => lhs == rhs,
            Comparator::Ne => lhs != rhs,
        }
    }

    /// Longest operator first so `<=` is not read as `<`.
    fn split(input: &str) -> Option<(&str, Comparator, &str)> {
        const OPS: [(&str, Comparator); 7] = [
            ("===", Comparator::Eq),
            ("<=", Comparator::Le),
            (">=", Comparator::Ge),
            ("==", Comparator::Eq),
            ("!=", Comparator::Ne),
            ("<", Comparator::Lt),
            (">", Comparator::Gt),
        ];
        let start = input.find(['<', '>', '=', '!'])?;
        let tail = &input[start..];
        OPS.iter()
            .find(|(tok, _)| tail.starts_with(tok))
            .map(|(tok, op)| (&input[..start], *op, &tail[tok.len()..]))
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        };
        f.write_str(s)
    }
}

/// `<stat> <op> <number>`, e.g. `p(95)<200`, `rate <= 0.05`, `avg < 1000`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub stat: Statistic,
    pub op: Comparator,
    pub literal: f64,
}

impl ThresholdExpr {
    /// `Some(observed)` with the pass flag, or `None` if the statistic has no
    /// value yet.
    pub fn evaluate(&self, stats: &SeriesStats, elapsed_secs: f64) -> Option<(bool, f64)> {
        let observed = self.stat.extract(stats, elapsed_secs)?;
        Some((self.op.holds(observed, self.literal), observed))
    }
}

impl FromStr for ThresholdExpr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lhs, op, rhs) =
            Comparator::split(s).ok_or_else(|| "missing comparison operator".to_string())?;
        let stat = Statistic::parse(lhs)?;
        let rhs = rhs.trim();
        let literal: f64 = rhs
            .parse()
            .map_err(|_| format!("'{}' is not a number", rhs))?;
        if !literal.is_finite() {
            return Err(format!("'{}' is not a finite number", rhs));
        }
        Ok(Self { stat, op, literal })
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.stat, self.op, self.literal)
    }
}
