use super::CrackState;
use crate::error::{CrackError, CrackingFailure, FailureKind};
use crate::model::{ElementId, ElementKind, RelationKind};
use log::{debug, trace};

impl CrackState<'_> {
    /// Entry count given by a cracked count relation targeting `id`.
    pub(super) fn count_from_relation(&mut self, id: ElementId) -> Result<Option<u64>, CrackError> {
        let Some((subject, index)) = self.bound(id, RelationKind::Count) else {
            return Ok(None);
        };
        let logical = self.relation_logical(subject, index)?;
        u64::try_from(logical)
            .map(Some)
            .map_err(|_| self.mismatch(id, format!("Count of {logical} is negative.")))
    }

    pub(super) fn crack_sequence(&mut self, id: ElementId) -> Result<(), CrackError> {
        let begin = self.cursor.position();
        let depth = self.cursor.limit_depth();
        let size = self.container_size(id)?;
        if let Some(bits) = size {
            self.push_bound(id, begin, bits);
        }
        let result = self.crack_entries(id);
        self.truncate_bounds(depth);
        result?;
        if let Some(bits) = size {
            let read = self.cursor.position() - begin;
            if read < bits {
                return Err(self.mismatch(
                    id,
                    format!("Length is {bits} bits but only read {read} bits."),
                ));
            }
        }
        Ok(())
    }

    fn crack_entries(&mut self, id: ElementId) -> Result<(), CrackError> {
        let ElementKind::Sequence(def) = self.dom.kind(id) else {
            return Ok(());
        };
        let (template, declared_min, declared_max) = (def.template, def.min_occurs, def.max_occurs);
        let name = self.dom.name(id).to_string();

        let (min, max) = match self.count_from_relation(id)? {
            Some(count) => {
                if let Some(max) = declared_max.filter(|max| count > *max) {
                    return Err(self.mismatch(
                        id,
                        format!("Count of {count} is greater than the maximum of {max}."),
                    ));
                }
                if count < declared_min {
                    return Err(self.mismatch(
                        id,
                        format!("Count of {count} is less than the minimum of {declared_min}."),
                    ));
                }
                (count, Some(count))
            }
            None => (declared_min, declared_max),
        };

        let mut index = 0u64;
        loop {
            if max.is_some_and(|max| index >= max) {
                break;
            }
            if index >= min {
                if self.cursor.is_at_end() {
                    break;
                }
                if self.following_token_matches(id)? {
                    trace!("{}Next token follows '{name}', stopping", self.indent());
                    break;
                }
            }

            let start = self.cursor.position();
            let checkpoint = self.checkpoint();
            let entry = self.dom.instantiate(template, id);
            self.dom.node_mut(entry).name = format!("{name}_{index}");
            self.push_entry(id, entry);

            match self.crack_node(entry) {
                Ok(()) => {
                    if self.cursor.position() == start && index >= min && max.is_none() {
                        self.rollback(checkpoint);
                        self.pop_entry(id);
                        break;
                    }
                    index += 1;
                }
                Err(e) if e.is_recoverable() => {
                    self.rollback(checkpoint);
                    self.pop_entry(id);
                    if index < min {
                        return Err(self.short_of(id, index, min, e));
                    }
                    debug!("{}'{name}' ends after {index} entries", self.indent());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn short_of(&self, id: ElementId, cracked: u64, min: u64, cause: CrackError) -> CrackError {
        let detail = cause
            .failure()
            .map(|f| f.to_string())
            .unwrap_or_else(|| cause.to_string());
        let kind = cause.kind().unwrap_or(FailureKind::StructuralMismatch);
        CrackError::new(
            kind,
            CrackingFailure {
                element: self.dom.full_name(id),
                element_type: self.dom.kind(id).type_name(),
                message: format!("Only cracked {cracked} of {min} entries. {detail}"),
                position: self.cursor.position(),
            },
        )
    }

    fn push_entry(&mut self, id: ElementId, entry: ElementId) {
        if let ElementKind::Sequence(def) = &mut self.dom.node_mut(id).kind {
            def.entries.push(entry);
        }
    }

    fn pop_entry(&mut self, id: ElementId) {
        if let ElementKind::Sequence(def) = &mut self.dom.node_mut(id).kind {
            def.entries.pop();
        }
    }
}
