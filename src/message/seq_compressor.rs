use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Compresses a set of call ids as runs of consecutive values: a run count followed by
///  `(gap to the end of the previous run, run length)` pairs. Ids of in-flight calls are mostly
///  dense, so this is typically a handful of bytes regardless of the number of calls.
pub fn compress_ids(ids: &[i64]) -> Bytes {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut runs: Vec<(i64, u32)> = Vec::new();
    for id in sorted {
        match runs.last_mut() {
            Some((start, len)) if *start + *len as i64 == id => *len += 1,
            _ => runs.push((id, 1)),
        }
    }

    let mut buf = BytesMut::with_capacity(4 + runs.len() * 12);
    buf.put_u32_le(runs.len() as u32);
    let mut prev_end = 0i64;
    for (start, len) in runs {
        buf.put_i64_le(start - prev_end);
        buf.put_u32_le(len);
        prev_end = start + len as i64;
    }
    buf.freeze()
}

pub fn decompress_ids(mut data: &[u8]) -> anyhow::Result<Vec<i64>> {
    let buf = &mut data;
    let num_runs = buf.try_get_u32_le()?;

    let mut result = Vec::new();
    let mut prev_end = 0i64;
    for _ in 0..num_runs {
        let start = prev_end + buf.try_get_i64_le()?;
        let len = buf.try_get_u32_le()?;
        if len == 0 {
            bail!("empty run in compressed id sequence");
        }
        for id in start..start + len as i64 {
            result.push(id);
        }
        prev_end = start + len as i64;
    }

    if buf.has_remaining() {
        bail!("{} trailing bytes after compressed ids", buf.remaining());
    }
    Ok(result)
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![5], vec![5])]
    #[case::dense(vec![3, 1, 2, 4], vec![1, 2, 3, 4])]
    #[case::gaps(vec![1, 2, 10, 11, 12, 20], vec![1, 2, 10, 11, 12, 20])]
    #[case::duplicates(vec![7, 7, 8], vec![7, 8])]
    fn test_compress(#[case] ids: Vec<i64>, #[case] expected: Vec<i64>) {
        assert_eq!(decompress_ids(&compress_ids(&ids)).unwrap(), expected);
    }

    #[test]
    fn test_dense_ids_are_compact() {
        let ids = (1..=1000).collect::<Vec<i64>>();
        assert_eq!(compress_ids(&ids).len(), 4 + 12);
    }

    #[test]
    fn test_malformed() {
        assert!(decompress_ids(&[1, 0]).is_err());
        let mut data = compress_ids(&[1, 2]).to_vec();
        data.push(0);
        assert!(decompress_ids(&data).is_err());
    }
}
