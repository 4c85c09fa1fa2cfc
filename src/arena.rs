pub type Token = std::num::NonZeroU32;

#[derive(Debug)]
struct Slot<T> {
    item: Option<T>,
    /// Next slot in this slot's ring.
    /// When `item` is None, points to the next vacant slot instead.
    next: Token,
    /// Previous slot in this slot's ring. Meaningless while vacant.
    prev: Token,
}

/// A slab of entries addressed by stable tokens, where occupied slots can be
/// threaded into circular doubly-linked rings (e.g. an LRU ring).
///
/// A slot stays at the same token for as long as it's occupied, so a token
/// held by an outside owner remains valid until the owner removes it.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    next_vacant: Token,
}

#[inline]
fn slot_idx(token: Token) -> usize {
    (token.get() - 1) as usize
}

impl<T> Arena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            next_vacant: Token::new(1).unwrap(),
        }
    }

    /// Places `item` in a vacant slot. The slot starts out in a ring of itself.
    ///
    /// # Panics
    /// Panics if the number of slots exceeds `u32::MAX - 1`.
    pub fn insert(&mut self, item: T) -> Token {
        let token = self.next_vacant;
        if let Some(slot) = self.slots.get_mut(slot_idx(token)) {
            debug_assert!(slot.item.is_none());
            self.next_vacant = slot.next;
            slot.item = Some(item);
            (slot.prev, slot.next) = (token, token);
        } else {
            debug_assert_eq!(slot_idx(token), self.slots.len());
            self.next_vacant =
                Token::new(token.get().wrapping_add(1)).expect("arena slot overflow");
            self.slots.push(Slot {
                item: Some(item),
                next: token,
                prev: token,
            });
        }
        token
    }

    #[inline]
    pub fn get(&self, token: Token) -> Option<&T> {
        self.slots.get(slot_idx(token)).and_then(|s| s.item.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.slots
            .get_mut(slot_idx(token))
            .and_then(|s| s.item.as_mut())
    }

    /// Splices a self-linked slot into the ring right before `head`, i.e. at
    /// the ring's tail. With no head the slot remains a ring of itself.
    /// Returns the ring head after the splice.
    ///
    /// # Panics
    /// Panics on out of bounds access.
    /// Panics (in debug mode) if the slot is vacant or not self-linked.
    pub fn link_before(&mut self, token: Token, head: Option<Token>) -> Token {
        let Some(head) = head else {
            debug_assert!(self.slots[slot_idx(token)].item.is_some());
            return token;
        };
        let tail = self.slots[slot_idx(head)].prev;
        self.slots[slot_idx(head)].prev = token;
        self.slots[slot_idx(tail)].next = token;
        let slot = &mut self.slots[slot_idx(token)];
        debug_assert!(slot.item.is_some());
        debug_assert!(slot.next == token && slot.prev == token);
        (slot.prev, slot.next) = (tail, head);
        head
    }

    /// Detaches the slot into a ring of itself.
    /// Returns the next slot of the old ring, unless the ring only held `token`.
    ///
    /// # Panics
    /// Panics on out of bounds access.
    /// Panics (in debug mode) if the slot is vacant.
    pub fn unlink(&mut self, token: Token) -> Option<Token> {
        let slot = &mut self.slots[slot_idx(token)];
        debug_assert!(slot.item.is_some());
        let (prev, next) = (slot.prev, slot.next);
        if next == token {
            debug_assert_eq!(prev, token);
            return None;
        }
        (slot.prev, slot.next) = (token, token);
        self.slots[slot_idx(next)].prev = prev;
        self.slots[slot_idx(prev)].next = next;
        Some(next)
    }

    /// Unlinks the slot and vacates it.
    /// Returns the item and the next slot of its old ring, if any.
    pub fn remove(&mut self, token: Token) -> Option<(T, Option<Token>)> {
        let next = self.unlink(token);
        let slot = &mut self.slots[slot_idx(token)];
        let item = slot.item.take()?;
        slot.next = self.next_vacant;
        self.next_vacant = token;
        Some((item, next))
    }

    /// Iterator over occupied slots, in token order.
    pub fn iter(&self) -> impl Iterator<Item = &'_ T> + '_ {
        self.slots.iter().filter_map(|s| s.item.as_ref())
    }

    /// Empties the arena, yielding the items. The arena is emptied even if
    /// the iterator isn't fully consumed.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.next_vacant = Token::new(1).unwrap();
        self.slots.drain(..).flat_map(|s| s.item)
    }

    /// The members of the ring containing `head`, in ring order.
    #[cfg(test)]
    pub fn ring(&self, head: Token) -> Vec<Token> {
        let mut members = vec![head];
        let mut cursor = self.slots[slot_idx(head)].next;
        while cursor != head {
            members.push(cursor);
            cursor = self.slots[slot_idx(cursor)].next;
        }
        members
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.item.is_some()).count()
    }

    #[cfg(test)]
    pub fn validate(&self) {
        let mut vacancies = std::collections::HashSet::new();
        let mut next_vacant = self.next_vacant;
        while slot_idx(next_vacant) != self.slots.len() {
            vacancies.insert(next_vacant);
            let slot = &self.slots[slot_idx(next_vacant)];
            assert!(slot.item.is_none(), "{next_vacant} vacant but occupied");
            next_vacant = slot.next;
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.item.is_some() {
                let token = Token::new(i as u32 + 1).unwrap();
                assert!(!vacancies.contains(&token));
                assert!(!vacancies.contains(&slot.prev));
                assert!(!vacancies.contains(&slot.next));
            }
        }
    }
}
