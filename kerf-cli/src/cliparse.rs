//! Hand-rolled parsers for the two small grammars the subcommand arguments
//! accept: a CPU-set spec (`4-7,10,12-14`) and a memory-size spec (`2GB`,
//! `512KB`, or a bare byte count). Neither grammar justifies a
//! parser-combinator dependency, so both are a few lines of `split`/`parse`.

use kerf_model::{KerfError, Result};

/// Parses a CPU-set specification: `spec := item (',' item)*`,
/// `item := <int> | <int> '-' <int>` (inclusive range, second ≥ first).
/// Returns the sorted, deduplicated set of CPU IDs named.
pub fn parse_cpu_spec(spec: &str) -> Result<Vec<u32>> {
    let mut cpus = std::collections::BTreeSet::new();
    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(KerfError::Parse(format!("empty item in CPU spec '{spec}'")));
        }
        if let Some((lo, hi)) = item.split_once('-') {
            let lo: u32 = lo
                .trim()
                .parse()
                .map_err(|_| KerfError::Parse(format!("invalid CPU range start in '{item}'")))?;
            let hi: u32 = hi
                .trim()
                .parse()
                .map_err(|_| KerfError::Parse(format!("invalid CPU range end in '{item}'")))?;
            if hi < lo {
                return Err(KerfError::Parse(format!(
                    "CPU range '{item}' has end less than start"
                )));
            }
            cpus.extend(lo..=hi);
        } else {
            let cpu: u32 = item
                .parse()
                .map_err(|_| KerfError::Parse(format!("invalid CPU ID '{item}'")))?;
            cpus.insert(cpu);
        }
    }
    Ok(cpus.into_iter().collect())
}

/// Parses a memory-size specification: `<number>('KB'|'MB'|'GB'|'TB')?`,
/// binary (1024-based) units; no suffix means bytes.
pub fn parse_memory_spec(spec: &str) -> Result<u64> {
    let spec = spec.trim();
    let (number_part, multiplier) = if let Some(prefix) = spec.strip_suffix("TB") {
        (prefix, 1u64 << 40)
    } else if let Some(prefix) = spec.strip_suffix("GB") {
        (prefix, 1u64 << 30)
    } else if let Some(prefix) = spec.strip_suffix("MB") {
        (prefix, 1u64 << 20)
    } else if let Some(prefix) = spec.strip_suffix("KB") {
        (prefix, 1u64 << 10)
    } else {
        (spec, 1u64)
    };
    let number: u64 = number_part
        .trim()
        .parse()
        .map_err(|_| KerfError::Parse(format!("invalid memory spec '{spec}'")))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| KerfError::Parse(format!("memory spec '{spec}' overflows a 64-bit byte count")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_cpu() {
        assert_eq!(parse_cpu_spec("4").unwrap(), vec![4]);
    }

    #[test]
    fn parses_range() {
        assert_eq!(parse_cpu_spec("4-7").unwrap(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn parses_mixed_list_sorted_and_deduped() {
        assert_eq!(
            parse_cpu_spec("10,4-7,10,12-14").unwrap(),
            vec![4, 5, 6, 7, 10, 12, 13, 14]
        );
    }

    #[test]
    fn rejects_descending_range() {
        assert!(parse_cpu_spec("7-4").is_err());
    }

    #[test]
    fn rejects_empty_item() {
        assert!(parse_cpu_spec("4,,5").is_err());
    }

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_memory_spec("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_binary_units() {
        assert_eq!(parse_memory_spec("2GB").unwrap(), 2 * (1u64 << 30));
        assert_eq!(parse_memory_spec("512MB").unwrap(), 512 * (1u64 << 20));
        assert_eq!(parse_memory_spec("4KB").unwrap(), 4 * (1u64 << 10));
        assert_eq!(parse_memory_spec("1TB").unwrap(), 1u64 << 40);
    }

    #[test]
    fn rejects_garbage_memory_spec() {
        assert!(parse_memory_spec("many gigabytes").is_err());
    }
}
