use std::io::Cursor;

use webrtc::sdp::description::session::SessionDescription;

use super::transport::IceCandidate;
use crate::error::ConnectionError;

/// The media sections of a remote description, as far as candidate
/// bookkeeping cares: their mids in m-line order and the BUNDLE groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MediaSections {
    mids: Vec<String>,
    bundles: Vec<Vec<String>>,
}

impl MediaSections {
    pub(crate) fn parse(sdp: &str) -> Result<Self, ConnectionError> {
        let mut reader = Cursor::new(sdp.as_bytes());
        let parsed = SessionDescription::unmarshal(&mut reader)
            .map_err(|err| ConnectionError::MalformedSdp(err.to_string()))?;
        if parsed.media_descriptions.is_empty() {
            return Err(ConnectionError::MalformedSdp(
                "description has no media sections".into(),
            ));
        }

        let mids = parsed
            .media_descriptions
            .iter()
            .enumerate()
            .map(|(index, media)| {
                media
                    .attributes
                    .iter()
                    .find(|attr| attr.key == "mid")
                    .and_then(|attr| attr.value.clone())
                    .unwrap_or_else(|| index.to_string())
            })
            .collect();

        let bundles = parsed
            .attributes
            .iter()
            .filter(|attr| attr.key == "group")
            .filter_map(|attr| attr.value.as_deref())
            .filter_map(|value| value.strip_prefix("BUNDLE"))
            .map(|members| members.split_whitespace().map(str::to_string).collect())
            .collect();

        Ok(Self { mids, bundles })
    }

    pub(crate) fn mids(&self) -> &[String] {
        &self.mids
    }

    /// The mid a candidate belongs to. Falls back to the m-line index when
    /// the sender left `sdpMid` empty.
    pub(crate) fn resolve(&self, candidate: &IceCandidate) -> Option<&str> {
        if !candidate.mid.is_empty() {
            return self
                .mids
                .iter()
                .find(|mid| **mid == candidate.mid)
                .map(String::as_str);
        }
        let index = candidate.mline_index? as usize;
        self.mids.get(index).map(String::as_str)
    }

    /// Mids that share a transport with `mid`, `mid` included.
    pub(crate) fn transport_group(&self, mid: &str) -> Vec<String> {
        self.bundles
            .iter()
            .find(|group| group.iter().any(|member| member == mid))
            .cloned()
            .unwrap_or_else(|| vec![mid.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::mock_sdp;

    #[test]
    fn collects_mids_in_mline_order() {
        let sdp = mock_sdp(1, &["0", "video"], false);
        let sections = MediaSections::parse(&sdp).unwrap();
        assert_eq!(sections.mids(), &["0".to_string(), "video".to_string()]);
        assert_eq!(sections.transport_group("0"), vec!["0".to_string()]);
    }

    #[test]
    fn bundle_groups_share_a_transport() {
        let sdp = mock_sdp(2, &["0", "1"], true);
        let sections = MediaSections::parse(&sdp).unwrap();
        assert_eq!(sections.transport_group("1"), vec!["0".to_string(), "1".to_string()]);
    }

    #[test]
    fn candidates_resolve_by_mid_or_index() {
        let sections = MediaSections::parse(&mock_sdp(3, &["a", "b"], false)).unwrap();
        let by_mid = IceCandidate::new("candidate:1", "b");
        assert_eq!(sections.resolve(&by_mid), Some("b"));
        let by_index = IceCandidate {
            candidate: "candidate:2".into(),
            mid: String::new(),
            mline_index: Some(0),
        };
        assert_eq!(sections.resolve(&by_index), Some("a"));
        assert_eq!(sections.resolve(&IceCandidate::new("candidate:3", "zzz")), None);
    }

    #[test]
    fn rejects_garbage_and_empty_descriptions() {
        assert!(matches!(
            MediaSections::parse("hello there"),
            Err(ConnectionError::MalformedSdp(_))
        ));
        assert!(matches!(
            MediaSections::parse(&mock_sdp(4, &[], false)),
            Err(ConnectionError::MalformedSdp(_))
        ));
    }
}
