use configurator_document::JsonTree;

/// A consistent view of orchestrator state
///
/// Pipeline runs work on a private clone; the published snapshot is only
/// ever replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub document: JsonTree,

    /// Last successfully rendered artifact
    pub rendered: Vec<u8>,

    /// Store version the document was read at, used for compare-and-set
    pub version: u64,
}

impl Snapshot {
    pub fn new(document: JsonTree) -> Self {
        Self {
            document,
            ..Default::default()
        }
    }
}
