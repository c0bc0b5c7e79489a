//! Context-triggered piecewise fingerprinting.
//!
//! A rolling checksum scans the byte stream and triggers a chunk boundary
//! whenever its value modulo the block size hits the trigger pattern. Each
//! chunk contributes one base64 character derived from an FNV-style digest,
//! and two digest streams (at the chosen block size and at double that size)
//! are joined with the block size into one signature of the form
//! `blocksize:digest:digest`. Comparison aligns block sizes by doubling or
//! halving, then scores a weighted edit distance between the digest streams.
//!
//! Fully deterministic: no randomness and no machine-dependent state, so
//! signatures are reproducible across runs and hosts. Applied both to whole
//! file contents (duplicate detection) and to each normalized text variant
//! of a subtitle track.

use crate::domain::matching::MatchError;

const ROLLING_WINDOW: usize = 7;
const MIN_BLOCKSIZE: u32 = 3;
const SPAMSUM_LENGTH: usize = 64;
const HASH_PRIME: u32 = 0x0100_0193;
const HASH_INIT: u32 = 0x2802_1967;
const B64: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Rolling checksum over the last [`ROLLING_WINDOW`] bytes.
#[derive(Default)]
struct RollingHash {
    window: [u8; ROLLING_WINDOW],
    h1: u32,
    h2: u32,
    h3: u32,
    n: usize,
}

impl RollingHash {
    fn update(&mut self, c: u8) {
        let c32 = u32::from(c);
        self.h2 = self
            .h2
            .wrapping_sub(self.h1)
            .wrapping_add(ROLLING_WINDOW as u32 * c32);
        self.h1 = self
            .h1
            .wrapping_add(c32)
            .wrapping_sub(u32::from(self.window[self.n % ROLLING_WINDOW]));
        self.window[self.n % ROLLING_WINDOW] = c;
        self.n += 1;
        self.h3 = self.h3.wrapping_shl(5) ^ c32;
    }

    fn hash(&self) -> u32 {
        self.h1.wrapping_add(self.h2).wrapping_add(self.h3)
    }
}

/// Compute the piecewise signature of a byte stream.
///
/// Fails with [`MatchError::InvalidInput`] on empty or whitespace-only
/// input; such input has no content to fingerprint.
pub fn compute(data: &[u8]) -> Result<String, MatchError> {
    if data.is_empty() || data.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(MatchError::InvalidInput(
            "cannot fingerprint empty or whitespace-only input".to_string(),
        ));
    }

    // Smallest block size whose coarse stream can cover the input.
    let mut block_size = MIN_BLOCKSIZE;
    while u64::from(block_size) * (SPAMSUM_LENGTH as u64) < data.len() as u64 {
        block_size *= 2;
    }

    loop {
        let (coarse, fine) = digest_pass(data, block_size);
        // A coarse stream shorter than half the target length means the
        // block size overshoots the input; step down and redo the pass.
        if block_size > MIN_BLOCKSIZE && coarse.len() < SPAMSUM_LENGTH / 2 {
            block_size /= 2;
        } else {
            return Ok(format!("{block_size}:{coarse}:{fine}"));
        }
    }
}

/// One scan of the input, producing the digest streams at `block_size` and
/// `2 * block_size`.
fn digest_pass(data: &[u8], block_size: u32) -> (String, String) {
    let mut roll = RollingHash::default();
    let mut h_coarse = HASH_INIT;
    let mut h_fine = HASH_INIT;
    let mut coarse: Vec<u8> = Vec::with_capacity(SPAMSUM_LENGTH);
    let mut fine: Vec<u8> = Vec::with_capacity(SPAMSUM_LENGTH / 2);

    for &c in data {
        roll.update(c);
        h_coarse = h_coarse.wrapping_mul(HASH_PRIME) ^ u32::from(c);
        h_fine = h_fine.wrapping_mul(HASH_PRIME) ^ u32::from(c);

        let r = roll.hash();
        if r % block_size == block_size - 1 && coarse.len() < SPAMSUM_LENGTH - 1 {
            coarse.push(B64[(h_coarse % 64) as usize]);
            h_coarse = HASH_INIT;
        }
        if r % (block_size * 2) == block_size * 2 - 1 && fine.len() < SPAMSUM_LENGTH / 2 - 1 {
            fine.push(B64[(h_fine % 64) as usize]);
            h_fine = HASH_INIT;
        }
    }

    // The tail that never hit a trigger still contributes one character.
    if roll.hash() != 0 {
        coarse.push(B64[(h_coarse % 64) as usize]);
        fine.push(B64[(h_fine % 64) as usize]);
    }

    (
        String::from_utf8(coarse).expect("digest characters are ASCII"),
        String::from_utf8(fine).expect("digest characters are ASCII"),
    )
}

/// Compare two signatures, returning a similarity in `[0, 100]`.
///
/// Fails with [`MatchError::InvalidInput`] on malformed signature syntax.
/// Signatures whose block sizes cannot be aligned by one doubling or
/// halving step compare as 0.
pub fn compare(sig1: &str, sig2: &str) -> Result<u32, MatchError> {
    let (bs1, s1_coarse, s1_fine) = parse_signature(sig1)?;
    let (bs2, s2_coarse, s2_fine) = parse_signature(sig2)?;

    if bs1 != bs2 && bs1 != bs2.wrapping_mul(2) && bs2 != bs1.wrapping_mul(2) {
        return Ok(0);
    }

    let s1_coarse = collapse_runs(&s1_coarse);
    let s1_fine = collapse_runs(&s1_fine);
    let s2_coarse = collapse_runs(&s2_coarse);
    let s2_fine = collapse_runs(&s2_fine);

    if bs1 == bs2 && s1_coarse == s2_coarse && s1_fine == s2_fine {
        return Ok(100);
    }

    let score = if bs1 == bs2 {
        let coarse = score_strings(&s1_coarse, &s2_coarse, bs1);
        let fine = score_strings(&s1_fine, &s2_fine, bs1 * 2);
        coarse.max(fine)
    } else if bs1 == bs2 * 2 {
        score_strings(&s1_coarse, &s2_fine, bs1)
    } else {
        score_strings(&s1_fine, &s2_coarse, bs2)
    };

    Ok(score)
}

/// Whether two signatures fingerprint near-identical content.
///
/// Used for duplicate-file detection over whole-file signatures.
pub fn is_duplicate(sig1: &str, sig2: &str, floor: u32) -> Result<bool, MatchError> {
    Ok(compare(sig1, sig2)? >= floor)
}

fn parse_signature(sig: &str) -> Result<(u32, String, String), MatchError> {
    let mut parts = sig.splitn(3, ':');
    let (Some(bs), Some(coarse), Some(fine)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(MatchError::InvalidInput(format!(
            "malformed fuzzy signature: {sig:?}"
        )));
    };
    let block_size: u32 = bs.parse().map_err(|_| {
        MatchError::InvalidInput(format!("malformed fuzzy signature block size: {bs:?}"))
    })?;
    if block_size < MIN_BLOCKSIZE || coarse.is_empty() {
        return Err(MatchError::InvalidInput(format!(
            "malformed fuzzy signature: {sig:?}"
        )));
    }
    for part in [coarse, fine] {
        if !part.bytes().all(|b| B64.contains(&b)) {
            return Err(MatchError::InvalidInput(format!(
                "invalid digest characters in fuzzy signature: {sig:?}"
            )));
        }
    }
    Ok((block_size, coarse.to_string(), fine.to_string()))
}

/// Collapse runs of more than three identical characters.
///
/// Long runs carry almost no information but would dominate the edit
/// distance.
fn collapse_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut run_char = '\0';
    let mut run_len = 0usize;
    for c in s.chars() {
        if c == run_char {
            run_len += 1;
        } else {
            run_char = c;
            run_len = 1;
        }
        if run_len <= 3 {
            out.push(c);
        }
    }
    out
}

/// Score two digest streams of the same block size.
fn score_strings(s1: &str, s2: &str, block_size: u32) -> u32 {
    let len1 = s1.len();
    let len2 = s2.len();
    if len1 > SPAMSUM_LENGTH || len2 > SPAMSUM_LENGTH {
        return 0;
    }
    if len1 == 0 || len2 == 0 || !has_common_substring(s1.as_bytes(), s2.as_bytes()) {
        return 0;
    }

    let dist = edit_distance(s1.as_bytes(), s2.as_bytes());

    // Rescale the distance to the fixed digest length, then invert into a
    // similarity percentage.
    let mut score = dist * SPAMSUM_LENGTH as u32 / (len1 + len2) as u32;
    score = 100 * score / SPAMSUM_LENGTH as u32;
    if score >= 100 {
        return 0;
    }
    score = 100 - score;

    // Small block sizes cannot support high scores for short digests;
    // without this cap tiny inputs produce spurious certainty.
    let cap_exempt = (99 + ROLLING_WINDOW as u32) / ROLLING_WINDOW as u32 * MIN_BLOCKSIZE;
    if block_size < cap_exempt {
        let cap = block_size / MIN_BLOCKSIZE * len1.min(len2) as u32;
        score = score.min(cap);
    }
    score
}

/// Require a common substring of [`ROLLING_WINDOW`] characters before
/// scoring; without one the edit distance is noise.
fn has_common_substring(s1: &[u8], s2: &[u8]) -> bool {
    if s1.len() < ROLLING_WINDOW || s2.len() < ROLLING_WINDOW {
        return false;
    }
    for w1 in s1.windows(ROLLING_WINDOW) {
        for w2 in s2.windows(ROLLING_WINDOW) {
            if w1 == w2 {
                return true;
            }
        }
    }
    false
}

/// Edit distance with unit insert/delete cost and substitution cost 2.
fn edit_distance(s1: &[u8], s2: &[u8]) -> u32 {
    let mut prev: Vec<u32> = (0..=s2.len() as u32).collect();
    let mut curr = vec![0u32; s2.len() + 1];
    for (i, &c1) in s1.iter().enumerate() {
        curr[0] = i as u32 + 1;
        for (j, &c2) in s2.iter().enumerate() {
            let sub = prev[j] + if c1 == c2 { 0 } else { 2 };
            curr[j + 1] = sub.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[s2.len()]
}
