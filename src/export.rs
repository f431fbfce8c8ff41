use std::path::Path;

use url::Url;

use crate::extract::Record;

const FALLBACK_FILENAME: &str = "reviews.csv";

/// `https://www.milky-mama.com/products/x` -> `milky-mama.csv`.
pub fn default_filename(url: &str) -> String {
    let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)) else {
        return FALLBACK_FILENAME.to_string();
    };
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let stem = match host.rsplit_once('.') {
        Some((stem, _tld)) => stem,
        None => host,
    };
    if stem.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        format!("{}.csv", stem)
    }
}

/// Write records with a `rating,author,title,description` header, even when
/// there are no records.
pub fn write_csv(path: &Path, records: &[Record]) -> Result<(), csv::Error> {
    let mut w = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    w.write_record(["rating", "author", "title", "description"])?;
    for record in records {
        w.serialize(record)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_host() {
        assert_eq!(default_filename("https://milky-mama.com/products/cookies"), "milky-mama.csv");
        assert_eq!(default_filename("https://www.milky-mama.com/"), "milky-mama.csv");
        assert_eq!(default_filename("https://shop.example.co.uk/p"), "shop.example.co.csv");
        assert_eq!(default_filename("http://localhost:8080/reviews"), "localhost.csv");
        assert_eq!(default_filename("not a url"), "reviews.csv");
    }

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let records = vec![
            Record {
                rating: "5".into(),
                author: "Dana R.".into(),
                title: "Lovely, really".into(),
                description: "Noticed a difference.".into(),
            },
            Record {
                rating: "N/A".into(),
                author: "No Author".into(),
                title: "No Title".into(),
                description: "Said \"wow\"".into(),
            },
        ];

        write_csv(&path, &records).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("rating,author,title,description"));
        assert_eq!(lines.next(), Some("5,Dana R.,\"Lovely, really\",Noticed a difference."));
        assert_eq!(lines.next(), Some("N/A,No Author,No Title,\"Said \"\"wow\"\"\""));

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let back: Vec<Record> = reader.deserialize().collect::<Result<_, _>>().unwrap();
        assert_eq!(back, records);
    }

    #[test]
    fn empty_run_still_has_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        write_csv(&path, &[]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "rating,author,title,description\n"
        );
    }
}
