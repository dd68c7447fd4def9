use super::report::RunReport;

/// One row per `(series, statistic)`: `metric,tags,type,stat,value`.
pub fn generate_csv(report: &RunReport) -> String {
    let mut out = String::from("metric,tags,type,stat,value\n");
    for series in &report.series {
        let tags = series
            .tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";");
        let kind = series.summary.kind();
        for (stat, value) in series.summary.fields() {
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                escape(&series.name),
                escape(&tags),
                kind,
                stat,
                value
            ));
        }
    }
    out
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
