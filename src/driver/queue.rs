//! 링 버퍼 큐
//!
//! 커서가 받은 문서를 소비 전까지 담아 둡니다. 용량은 1024 미만에서는 두
//! 배로, 그 이상에서는 25%씩 늘어납니다.

/// 첫 확장 용량
const INITIAL_CAPACITY: usize = 8;

/// 두 배 성장 상한
const DOUBLING_LIMIT: usize = 1024;

/// FIFO 링 버퍼
#[derive(Debug, Clone)]
pub struct Queue<T> {
    elems: Vec<Option<T>>,
    len: usize,
    pop_at: usize,
    push_at: usize,
}

impl<T> Queue<T> {
    /// 빈 큐
    pub fn new() -> Self {
        Self {
            elems: Vec::new(),
            len: 0,
            pop_at: 0,
            push_at: 0,
        }
    }

    /// 요소 수
    pub fn len(&self) -> usize {
        self.len
    }

    /// 비었는지 여부
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 현재 용량
    pub fn capacity(&self) -> usize {
        self.elems.len()
    }

    /// 뒤에 추가
    pub fn push(&mut self, elem: T) {
        if self.len == self.elems.len() {
            self.expand();
        }
        self.elems[self.push_at] = Some(elem);
        self.len += 1;
        self.push_at = (self.push_at + 1) % self.elems.len();
    }

    /// 앞에서 꺼냄
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let elem = self.elems[self.pop_at].take();
        self.len -= 1;
        self.pop_at = (self.pop_at + 1) % self.elems.len();
        elem
    }

    /// 모두 비움
    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }

    fn expand(&mut self) {
        let current = self.elems.len();
        let grown = if current == 0 {
            INITIAL_CAPACITY
        } else if current < DOUBLING_LIMIT {
            current * 2
        } else {
            current + current / 4
        };

        let mut elems: Vec<Option<T>> = Vec::with_capacity(grown);
        elems.resize_with(grown, || None);

        // 꺼낼 위치부터 순서대로 새 버퍼 앞쪽에 옮김
        for i in 0..self.len {
            let from = (self.pop_at + i) % current;
            elems[i] = self.elems[from].take();
        }
        self.elems = elems;
        self.pop_at = 0;
        self.push_at = self.len;
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}
