//! Canonical textual manifest codec (§4.2): one byte-exact form per artifact kind.
//!
//! Modeled on `internal/object/commit.rs` (typed struct + `Display` + hash-on-construct
//! pattern), restructured around a textual card grammar instead of a binary commit object;
//! the shared-tokenizer-then-dispatch design mirrors `ObjectTrait::from_bytes` deciding a
//! type tag before constructing a concrete value.

pub mod cards;

use bstr::BString;
use chrono::{DateTime, NaiveDateTime, Utc};
use md5::{Digest as _, Md5};

use crate::errors::FossilError;
use crate::hash::ArtifactHash;
use cards::Card;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

fn md5_hex(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    hex::encode(digest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perm {
    Regular,
    Executable,
    Symlink,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: BString,
    /// Absent means "removed in this delta manifest".
    pub hash: Option<ArtifactHash>,
    pub perm: Perm,
    pub old_path: Option<BString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOp {
    AddPropagating,
    AddOneShot,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagTarget {
    /// `*` — the commit this manifest itself describes.
    SelfCommit,
    Other(ArtifactHash),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCard {
    pub op: TagOp,
    pub name: String,
    pub target: TagTarget,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CherryPickSign {
    Pick,
    Backout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CherryPick {
    pub sign: CherryPickSign,
    pub hash: ArtifactHash,
    pub source: Option<ArtifactHash>,
}

/// Decoded form of a commit artifact (§3.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitManifest {
    pub baseline: Option<ArtifactHash>,
    pub comment: BString,
    pub date: DateTime<Utc>,
    pub files: Vec<FileEntry>,
    pub mimetype: Option<String>,
    pub parents: Vec<ArtifactHash>,
    pub cherrypicks: Vec<CherryPick>,
    pub checksum: Option<String>,
    pub tags: Vec<TagCard>,
    pub user: String,
}

/// A non-commit artifact whose only content is tag cards (a standalone "control" artifact).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlManifest {
    pub date: DateTime<Utc>,
    pub user: String,
    pub tags: Vec<TagCard>,
}

/// Any other in-scope-to-read, out-of-scope-to-interpret artifact kind (ticket, wiki, event,
/// attachment, cluster, attestation): the shared header is decoded, the rest kept opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub cards: Vec<(u8, Vec<BString>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    Commit(CommitManifest),
    Control(ControlManifest),
    Other(RawManifest),
}

fn perm_token(perm: Perm) -> Option<&'static str> {
    match perm {
        Perm::Regular => None,
        Perm::Executable => Some("x"),
        Perm::Symlink => Some("l"),
    }
}

fn parse_perm(token: Option<&str>) -> Result<Perm, FossilError> {
    match token {
        None | Some("") => Ok(Perm::Regular),
        Some("x") => Ok(Perm::Executable),
        Some("l") => Ok(Perm::Symlink),
        Some(other) => Err(FossilError::Integrity(format!(
            "invalid F-card permission token: {other}"
        ))),
    }
}

fn field_str(field: &BString) -> String {
    field.to_string()
}

impl CommitManifest {
    fn build_cards(&self) -> Vec<Card> {
        let mut cards = Vec::new();

        if let Some(baseline) = &self.baseline {
            cards.push(Card {
                code: b'B',
                fields: vec![BString::from(baseline.to_string())],
            });
        }

        let comment_field = if self.comment.is_empty() {
            BString::from("(no comment)")
        } else {
            self.comment.clone()
        };
        cards.push(Card {
            code: b'C',
            fields: vec![comment_field],
        });

        cards.push(Card {
            code: b'D',
            fields: vec![BString::from(self.date.format(DATE_FORMAT).to_string())],
        });

        let mut sorted_files = self.files.clone();
        sorted_files.sort_by(|a, b| a.path.cmp(&b.path));
        for f in &sorted_files {
            let mut fields = vec![f.path.clone()];
            if let Some(hash) = &f.hash {
                fields.push(BString::from(hash.to_string()));
                if let Some(tok) = perm_token(f.perm) {
                    fields.push(BString::from(tok));
                    if let Some(old) = &f.old_path {
                        fields.push(old.clone());
                    }
                } else if f.old_path.is_some() {
                    fields.push(BString::from(""));
                    if let Some(old) = &f.old_path {
                        fields.push(old.clone());
                    }
                }
            }
            cards.push(Card { code: b'F', fields });
        }

        if let Some(mimetype) = &self.mimetype {
            cards.push(Card {
                code: b'N',
                fields: vec![BString::from(mimetype.clone())],
            });
        }

        if !self.parents.is_empty() {
            let fields = self
                .parents
                .iter()
                .map(|p| BString::from(p.to_string()))
                .collect();
            cards.push(Card { code: b'P', fields });
        }

        for cp in &self.cherrypicks {
            let sign = match cp.sign {
                CherryPickSign::Pick => '+',
                CherryPickSign::Backout => '-',
            };
            let mut fields = vec![BString::from(format!("{sign}{}", cp.hash))];
            if let Some(src) = &cp.source {
                fields.push(BString::from(src.to_string()));
            }
            cards.push(Card { code: b'Q', fields });
        }

        if let Some(checksum) = &self.checksum {
            cards.push(Card {
                code: b'R',
                fields: vec![BString::from(checksum.clone())],
            });
        }

        let mut sorted_tags = self.tags.clone();
        sorted_tags.sort_by(|a, b| a.name.cmp(&b.name));
        for t in &sorted_tags {
            let prefix = match t.op {
                TagOp::AddPropagating => '*',
                TagOp::AddOneShot => '+',
                TagOp::Cancel => '-',
            };
            let target = match &t.target {
                TagTarget::SelfCommit => "*".to_string(),
                TagTarget::Other(h) => h.to_string(),
            };
            let mut fields = vec![
                BString::from(format!("{prefix}{}", t.name)),
                BString::from(target),
            ];
            if let Some(v) = &t.value {
                fields.push(BString::from(v.clone()));
            }
            cards.push(Card { code: b'T', fields });
        }

        cards.push(Card {
            code: b'U',
            fields: vec![BString::from(self.user.clone())],
        });

        cards
    }

    /// Render to canonical bytes, computing and appending the trailing Z-card.
    pub fn encode(&self) -> Vec<u8> {
        let cards = self.build_cards();
        let mut bytes = cards::render(&cards);
        let sig = md5_hex(&bytes);
        bytes.extend_from_slice(format!("Z {sig}\n").as_bytes());
        bytes
    }

    /// F-card count, used by the check-in engine's baseline-vs-delta size heuristic (§4.4.4).
    pub fn file_card_count(&self) -> usize {
        self.files.len()
    }
}

fn parse_tag_card(card: &Card) -> Result<TagCard, FossilError> {
    if card.fields.is_empty() {
        return Err(FossilError::Integrity("T-card missing fields".into()));
    }
    let raw_name = field_str(&card.fields[0]);
    let mut chars = raw_name.chars();
    let op = match chars.next() {
        Some('*') => TagOp::AddPropagating,
        Some('+') => TagOp::AddOneShot,
        Some('-') => TagOp::Cancel,
        _ => {
            return Err(FossilError::Integrity(
                "T-card name missing operation prefix".into(),
            ));
        }
    };
    let name: String = chars.collect();

    let target = match card.fields.get(1).map(field_str) {
        Some(ref s) if s == "*" => TagTarget::SelfCommit,
        Some(s) => TagTarget::Other(s.parse().map_err(FossilError::Integrity)?),
        None => {
            return Err(FossilError::Integrity("T-card missing target".into()));
        }
    };

    let value = card.fields.get(2).map(field_str);

    Ok(TagCard {
        op,
        name,
        target,
        value,
    })
}

fn parse_cherrypick(card: &Card) -> Result<CherryPick, FossilError> {
    let first = card
        .fields
        .first()
        .map(field_str)
        .ok_or_else(|| FossilError::Integrity("Q-card missing fields".into()))?;
    let mut chars = first.chars();
    let sign = match chars.next() {
        Some('+') => CherryPickSign::Pick,
        Some('-') => CherryPickSign::Backout,
        _ => return Err(FossilError::Integrity("Q-card missing sign".into())),
    };
    let hash: ArtifactHash = chars.as_str().parse().map_err(FossilError::Integrity)?;
    let source = card
        .fields
        .get(1)
        .map(field_str)
        .map(|s| s.parse())
        .transpose()
        .map_err(FossilError::Integrity)?;
    Ok(CherryPick {
        sign,
        hash,
        source,
    })
}

fn parse_date(s: &str) -> Result<DateTime<Utc>, FossilError> {
    let naive = NaiveDateTime::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| FossilError::Integrity(format!("invalid D-card date {s:?}: {e}")))?;
    Ok(naive.and_utc())
}

/// Decode a manifest's bytes: tokenize, validate card ordering and the Z-card checksum, then
/// dispatch on which mandatory cards are present.
pub fn decode(data: &[u8]) -> Result<Manifest, FossilError> {
    let all_cards = cards::tokenize(data)?;

    let z_pos = all_cards
        .iter()
        .position(|c| c.code == b'Z')
        .ok_or_else(|| FossilError::Integrity("manifest missing Z-card".into()))?;
    if z_pos != all_cards.len() - 1 {
        return Err(FossilError::Integrity(
            "Z-card must be the final card".into(),
        ));
    }

    let mut prev_code = 0u8;
    for card in &all_cards {
        if card.code < prev_code {
            return Err(FossilError::Integrity(format!(
                "cards out of order: {} follows {}",
                card.code as char, prev_code as char
            )));
        }
        prev_code = card.code;
    }

    let mut prev_path: Option<&BString> = None;
    for card in &all_cards {
        if card.code == b'F' {
            let path = card
                .fields
                .first()
                .ok_or_else(|| FossilError::Integrity("F-card missing path".into()))?;
            if let Some(prev) = prev_path {
                if path <= prev {
                    return Err(FossilError::Integrity(
                        "F-cards not strictly ascending by path".into(),
                    ));
                }
            }
            prev_path = Some(path);
        }
    }

    let without_z = &all_cards[..z_pos];
    let body_bytes = cards::render(without_z);
    let expected_sig = field_str(
        all_cards[z_pos]
            .fields
            .first()
            .ok_or_else(|| FossilError::Integrity("Z-card missing value".into()))?,
    );
    let actual_sig = md5_hex(&body_bytes);
    if actual_sig != expected_sig.to_ascii_lowercase() {
        return Err(FossilError::Integrity(format!(
            "Z-card checksum mismatch: manifest claims {expected_sig}, recomputed {actual_sig}"
        )));
    }

    let has_commit_cards = all_cards.iter().any(|c| c.code == b'C')
        && all_cards.iter().any(|c| c.code == b'D')
        && all_cards.iter().any(|c| c.code == b'U');

    if has_commit_cards {
        return Ok(Manifest::Commit(decode_commit(&all_cards)?));
    }

    let has_only_date_user_tags = all_cards
        .iter()
        .all(|c| matches!(c.code, b'D' | b'U' | b'T' | b'Z'));
    if has_only_date_user_tags
        && all_cards.iter().any(|c| c.code == b'D')
        && all_cards.iter().any(|c| c.code == b'U')
    {
        let date = parse_date(&field_str(
            all_cards
                .iter()
                .find(|c| c.code == b'D')
                .unwrap()
                .fields
                .first()
                .ok_or_else(|| FossilError::Integrity("D-card missing value".into()))?,
        ))?;
        let user = field_str(
            all_cards
                .iter()
                .find(|c| c.code == b'U')
                .unwrap()
                .fields
                .first()
                .ok_or_else(|| FossilError::Integrity("U-card missing value".into()))?,
        );
        let tags = all_cards
            .iter()
            .filter(|c| c.code == b'T')
            .map(parse_tag_card)
            .collect::<Result<_, _>>()?;
        return Ok(Manifest::Control(ControlManifest { date, user, tags }));
    }

    Ok(Manifest::Other(RawManifest {
        cards: all_cards
            .into_iter()
            .map(|c| (c.code, c.fields))
            .collect(),
    }))
}

fn decode_commit(all_cards: &[Card]) -> Result<CommitManifest, FossilError> {
    let mut baseline = None;
    let mut comment = BString::from("");
    let mut date = None;
    let mut files = Vec::new();
    let mut mimetype = None;
    let mut parents = Vec::new();
    let mut cherrypicks = Vec::new();
    let mut checksum = None;
    let mut tags = Vec::new();
    let mut user = None;

    for card in all_cards {
        match card.code {
            b'B' => {
                let s = field_str(
                    card.fields
                        .first()
                        .ok_or_else(|| FossilError::Integrity("B-card missing value".into()))?,
                );
                baseline = Some(s.parse().map_err(FossilError::Integrity)?);
            }
            b'C' => {
                comment = card
                    .fields
                    .first()
                    .cloned()
                    .ok_or_else(|| FossilError::Integrity("C-card missing value".into()))?;
            }
            b'D' => {
                date = Some(parse_date(&field_str(card.fields.first().ok_or_else(
                    || FossilError::Integrity("D-card missing value".into()),
                )?))?);
            }
            b'F' => {
                let path = card
                    .fields
                    .first()
                    .cloned()
                    .ok_or_else(|| FossilError::Integrity("F-card missing path".into()))?;
                let hash = card
                    .fields
                    .get(1)
                    .map(field_str)
                    .map(|s| s.parse())
                    .transpose()
                    .map_err(FossilError::Integrity)?;
                let perm = parse_perm(card.fields.get(2).map(|f| field_str(f)).as_deref())?;
                let old_path = card.fields.get(3).cloned();
                files.push(FileEntry {
                    path,
                    hash,
                    perm,
                    old_path,
                });
            }
            b'N' => {
                mimetype = card.fields.first().map(field_str);
            }
            b'P' => {
                parents = card
                    .fields
                    .iter()
                    .map(|f| field_str(f).parse())
                    .collect::<Result<_, _>>()
                    .map_err(FossilError::Integrity)?;
            }
            b'Q' => {
                cherrypicks.push(parse_cherrypick(card)?);
            }
            b'R' => {
                checksum = card.fields.first().map(field_str);
            }
            b'T' => {
                tags.push(parse_tag_card(card)?);
            }
            b'U' => {
                user = card.fields.first().map(field_str);
            }
            b'Z' => {}
            other => {
                return Err(FossilError::Integrity(format!(
                    "unexpected card code in commit manifest: {}",
                    other as char
                )));
            }
        }
    }

    Ok(CommitManifest {
        baseline,
        comment,
        date: date.ok_or_else(|| FossilError::Integrity("commit missing D-card".into()))?,
        files,
        mimetype,
        parents,
        cherrypicks,
        checksum,
        tags,
        user: user.ok_or_else(|| FossilError::Integrity("commit missing U-card".into()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashPolicy;

    fn sample_commit() -> CommitManifest {
        CommitManifest {
            baseline: None,
            comment: BString::from("fix bug"),
            date: "2024-01-01T00:00:00.000"
                .parse::<NaiveDateTime>()
                .unwrap()
                .and_utc(),
            files: vec![FileEntry {
                path: BString::from("a.txt"),
                hash: Some(ArtifactHash::compute_with(HashPolicy::Sha1, b"content")),
                perm: Perm::Regular,
                old_path: None,
            }],
            mimetype: None,
            parents: vec![ArtifactHash::compute_with(HashPolicy::Sha1, b"parent")],
            cherrypicks: vec![],
            checksum: None,
            tags: vec![],
            user: "alice".to_string(),
        }
    }

    #[test]
    fn round_trip_commit_manifest() {
        let commit = sample_commit();
        let encoded = commit.encode();
        let decoded = decode(&encoded).unwrap();
        match decoded {
            Manifest::Commit(c) => assert_eq!(c, commit),
            other => panic!("expected Commit, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_bad_zcard() {
        let commit = sample_commit();
        let mut encoded = commit.encode();
        let len = encoded.len();
        encoded[len - 5] ^= 0xff;
        let err = decode(&encoded).unwrap_err();
        assert!(matches!(err, FossilError::Integrity(_)));
    }

    #[test]
    fn decode_rejects_out_of_order_fcards() {
        let mut commit = sample_commit();
        commit.files.push(FileEntry {
            path: BString::from("A-early.txt"),
            hash: Some(ArtifactHash::compute_with(HashPolicy::Sha1, b"x")),
            perm: Perm::Regular,
            old_path: None,
        });
        // Build cards manually, but out of order, bypassing the sort `build_cards` does.
        let mut cards = commit.build_cards();
        let positions: Vec<usize> = cards
            .iter()
            .enumerate()
            .filter(|(_, c)| c.code == b'F')
            .map(|(i, _)| i)
            .collect();
        cards.swap(positions[0], positions[1]);
        let mut bytes = cards::render(&cards);
        let sig = md5_hex(&bytes);
        bytes.extend_from_slice(format!("Z {sig}\n").as_bytes());

        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FossilError::Integrity(_)));
    }

    #[test]
    fn empty_comment_renders_placeholder() {
        let mut commit = sample_commit();
        commit.comment = BString::from("");
        let encoded = commit.encode();
        let text = String::from_utf8_lossy(&encoded);
        assert!(text.contains("C (no\\scomment)\n"));
    }
}
