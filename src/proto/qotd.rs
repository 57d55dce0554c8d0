//! Quote of the day protocol (RFC 865).
//!
//! Rather than shipping a quote database, each connection gets a freshly
//! composed pseudo-random word sequence drawn from a dictionary file. Words
//! are joined with randomly chosen punctuation and the first word of each
//! sentence is capitalized, which reads just plausibly enough for testing.
//!
//! Options:
//! - `-d <file>`: dictionary file, one word per line
//!   (default `/usr/dict/words`, then `/usr/share/dict/words`)
//! - `-w <n>` or `-w <min>-<max>`: number of words per quote (default 5)

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;
use rand::Rng;
use tracing::warn;

use crate::error::SetupError;
use crate::proto::onetime::OnetimeDriver;
use crate::proto::{ArgCursor, ProtocolInstance};
use crate::runtime::conn::Conn;

const DEFAULT_DICTIONARIES: &[&str] = &["/usr/dict/words", "/usr/share/dict/words"];

/// Last-resort dictionary for hosts with no word list installed.
const BUILTIN_WORDS: &[&str] = &[
    "it",
    "is",
    "annoying",
    "that",
    "your",
    "dictionary",
    "is",
    "missing",
];

pub fn construct(args: &mut ArgCursor<'_>) -> Result<Box<dyn ProtocolInstance>, SetupError> {
    let mut dict_path = None;
    let mut min_words = 5;
    let mut max_words = 5;

    loop {
        if let Some(path) = args.take_option("-d") {
            dict_path = Some(path);
        } else if let Some(range) = args.take_option("-w") {
            (min_words, max_words) = parse_word_count(range)?;
        } else {
            break;
        }
    }

    let mut dict = load_dictionary(dict_path);
    if dict.len() < 3 {
        warn!("dictionary unusable, falling back to the built-in word list");
        dict = BUILTIN_WORDS.iter().map(|w| w.to_string()).collect();
    }

    Ok(Box::new(Qotd {
        dict,
        min_words,
        max_words,
    }))
}

fn parse_word_count(arg: &str) -> Result<(usize, usize), SetupError> {
    let bad = |reason: String| SetupError::BadProtocolOption {
        proto: "qotd",
        option: "-w",
        reason,
    };

    if let Some((lo, hi)) = arg.split_once('-') {
        let min: usize = lo
            .parse()
            .map_err(|_| bad(format!("'{arg}' is not a count or min-max range")))?;
        let max: usize = hi
            .parse()
            .map_err(|_| bad(format!("'{arg}' is not a count or min-max range")))?;
        if min < 1 || max <= min {
            return Err(bad(format!("range '{arg}' must satisfy 1 <= min < max")));
        }
        Ok((min, max))
    } else {
        let n: usize = arg
            .parse()
            .map_err(|_| bad(format!("'{arg}' is not a count or min-max range")))?;
        if n < 1 {
            return Err(bad("word count must be at least 1".to_string()));
        }
        Ok((n, n))
    }
}

/// Read and filter a dictionary: short lowercase alphabetic words only, so
/// the output stays pronounceable and bounded.
fn load_dictionary(explicit: Option<&str>) -> Vec<String> {
    let candidates: Vec<&str> = match explicit {
        Some(path) => vec![path],
        None => DEFAULT_DICTIONARIES.to_vec(),
    };

    for path in candidates {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(_) => continue,
        };
        return BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|w| usable_word(w))
            .collect();
    }
    Vec::new()
}

fn usable_word(w: &str) -> bool {
    (3..=8).contains(&w.len()) && w.bytes().all(|b| b.is_ascii_lowercase())
}

pub struct Qotd {
    dict: Vec<String>,
    min_words: usize,
    max_words: usize,
}

impl Qotd {
    fn compose<R: Rng>(&self, rng: &mut R) -> Vec<u8> {
        let count = if self.max_words > self.min_words {
            rng.gen_range(self.min_words..=self.max_words)
        } else {
            self.min_words
        };

        let mut out = String::new();
        let mut capitalize = true;
        for i in 0..count {
            if i > 0 {
                match rng.gen_range(0..36) {
                    0..=2 => out.push_str(", "),
                    3..=4 => {
                        out.push_str(".  ");
                        capitalize = true;
                    }
                    5 => out.push_str(" -- "),
                    _ => out.push(' '),
                }
            }
            let word = &self.dict[rng.gen_range(0..self.dict.len())];
            if capitalize {
                out.push(word.as_bytes()[0].to_ascii_uppercase() as char);
                out.push_str(&word[1..]);
            } else {
                out.push_str(word);
            }
            capitalize = false;
        }
        match rng.gen_range(0..10) {
            0 | 1 => {}
            2 => out.push('!'),
            _ => out.push('.'),
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

impl ProtocolInstance for Qotd {
    fn new_connection(
        &self,
        stream: TcpStream,
        _peer: SocketAddr,
        _now: Instant,
    ) -> io::Result<Conn> {
        let quote = self.compose(&mut rand::thread_rng());
        Ok(Conn::new(
            stream,
            Box::new(OnetimeDriver::new(quote)),
            OnetimeDriver::interest(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write as _;

    #[test]
    fn word_count_accepts_single_values_and_ranges() {
        assert_eq!(parse_word_count("5").unwrap(), (5, 5));
        assert_eq!(parse_word_count("3-7").unwrap(), (3, 7));
        assert!(parse_word_count("0").is_err());
        assert!(parse_word_count("7-3").is_err());
        assert!(parse_word_count("5-5").is_err());
        assert!(parse_word_count("lots").is_err());
    }

    #[test]
    fn dictionary_filter_keeps_short_lowercase_words() {
        assert!(usable_word("apple"));
        assert!(usable_word("fig"));
        assert!(!usable_word("no"));
        assert!(!usable_word("overgrown"));
        assert!(!usable_word("Apple"));
        assert!(!usable_word("won't"));
    }

    #[test]
    fn dictionary_file_is_loaded_and_filtered() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "apple\nBanana\nno\ncherry\nlonglonglong\nfig").unwrap();

        let dict = load_dictionary(Some(file.path().to_str().unwrap()));
        assert_eq!(dict, vec!["apple", "cherry", "fig"]);
    }

    #[test]
    fn missing_dictionary_yields_empty_list() {
        let dict = load_dictionary(Some("/nonexistent/words"));
        assert!(dict.is_empty());
    }

    #[test]
    fn quotes_end_in_crlf_and_use_dictionary_words() {
        let q = Qotd {
            dict: vec!["apple".into(), "cherry".into(), "fig".into()],
            min_words: 3,
            max_words: 6,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let quote = q.compose(&mut rng);
            let text = String::from_utf8(quote).unwrap();
            assert!(text.ends_with("\r\n"));
            let first = text.chars().next().unwrap();
            assert!(first.is_ascii_uppercase());
        }
    }

    #[test]
    fn fixed_count_quotes_contain_that_many_words() {
        let q = Qotd {
            dict: vec!["oak".into(), "elm".into(), "yew".into()],
            min_words: 4,
            max_words: 4,
        };
        let mut rng = StdRng::seed_from_u64(11);
        let text = String::from_utf8(q.compose(&mut rng)).unwrap();
        let words = text
            .matches(|c: char| c.is_ascii_alphabetic())
            .count();
        // Three-letter words only, so the letter count is four words' worth.
        assert_eq!(words, 12);
    }
}
